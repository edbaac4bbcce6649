use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::probe::AgentId;
use crate::stats::{WindowStats, micros_to_millis_f64, x100_to_f64};

/// Per-cycle TrafficSim result as emitted to the result sink.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSimReport {
    pub target: String,
    pub peer_agent: AgentId,
    pub cycle: u64,
    pub total_packets: u64,
    pub received_packets: u64,
    pub lost_packets: u64,
    pub pending_packets: u64,
    pub duplicate_packets: u64,
    #[serde(rename = "outOfSequence")]
    pub out_of_sequence: u64,
    pub loss_percentage: f64,
    #[serde(rename = "averageRTT")]
    pub average_rtt: f64,
    #[serde(rename = "minRTT")]
    pub min_rtt: f64,
    #[serde(rename = "maxRTT")]
    pub max_rtt: f64,
    #[serde(rename = "stdDevRTT")]
    pub std_dev_rtt: f64,
    pub jitter: f64,
    #[serde(rename = "p50RTT")]
    pub p50_rtt: f64,
    #[serde(rename = "p90RTT")]
    pub p90_rtt: f64,
    #[serde(rename = "p99RTT")]
    pub p99_rtt: f64,
    pub report_time: DateTime<Utc>,
    /// Raw integer statistics the figures above were rendered from.
    #[serde(skip)]
    pub stats: WindowStats,
}

impl TrafficSimReport {
    /// RTT figures are rendered in milliseconds.
    #[must_use]
    pub fn new(target: &str, peer_agent: &AgentId, cycle: u64, stats: WindowStats) -> Self {
        Self {
            target: target.to_owned(),
            peer_agent: peer_agent.clone(),
            cycle,
            total_packets: stats.total_packets,
            received_packets: stats.received_packets,
            lost_packets: stats.lost_packets,
            pending_packets: stats.pending_packets,
            duplicate_packets: stats.duplicate_packets,
            out_of_sequence: stats.out_of_order_packets,
            loss_percentage: x100_to_f64(stats.loss_pct_x100),
            average_rtt: micros_to_millis_f64(stats.avg_rtt_us),
            min_rtt: micros_to_millis_f64(stats.min_rtt_us),
            max_rtt: micros_to_millis_f64(stats.max_rtt_us),
            std_dev_rtt: micros_to_millis_f64(stats.std_dev_rtt_us),
            jitter: micros_to_millis_f64(stats.jitter_us),
            p50_rtt: micros_to_millis_f64(stats.p50_rtt_us),
            p90_rtt: micros_to_millis_f64(stats.p90_rtt_us),
            p99_rtt: micros_to_millis_f64(stats.p99_rtt_us),
            report_time: Utc::now(),
            stats,
        }
    }
}
