use std::collections::BTreeMap;
use std::time::Duration;

use super::RttHistogram;

/// Per-sequence timing for one cycle, keyed by sequence number.
pub type PacketMap = BTreeMap<u32, PacketTiming>;

/// Send/receive record for one DATA packet.
///
/// Times are microseconds on the owning session's monotonic clock, so
/// `received_us >= sent_us` holds by construction. `sent_wall_ms` is the value
/// carried in the DATA message and echoed back by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketTiming {
    pub sent_us: u64,
    pub sent_wall_ms: i64,
    pub received_us: Option<u64>,
    pub timed_out: bool,
    pub duplicates: u32,
}

/// How an ACK was applied to a [`PacketTiming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Duplicate,
    LateAfterTimeout,
}

impl PacketTiming {
    #[must_use]
    pub const fn new(sent_us: u64, sent_wall_ms: i64) -> Self {
        Self {
            sent_us,
            sent_wall_ms,
            received_us: None,
            timed_out: false,
            duplicates: 0,
        }
    }

    /// Applies an ACK. The first classification wins: a packet already timed
    /// out stays lost, a packet already received only counts a duplicate.
    pub fn mark_received(&mut self, now_us: u64) -> AckOutcome {
        if self.timed_out {
            return AckOutcome::LateAfterTimeout;
        }
        if self.received_us.is_some() {
            self.duplicates = self.duplicates.saturating_add(1);
            return AckOutcome::Duplicate;
        }
        self.received_us = Some(now_us.max(self.sent_us));
        AckOutcome::Accepted
    }

    /// Flags the packet as lost once it has waited longer than `loss_timeout`
    /// without an ACK. Returns true when this call changed the flag.
    pub fn expire(&mut self, now_us: u64, loss_timeout: Duration) -> bool {
        if self.timed_out || self.received_us.is_some() {
            return false;
        }
        if now_us.saturating_sub(self.sent_us) > duration_us(loss_timeout) {
            self.timed_out = true;
            return true;
        }
        false
    }

    const fn is_lost(&self, now_us: u64, loss_timeout_us: u64) -> bool {
        if self.timed_out {
            return true;
        }
        self.received_us.is_none() && now_us.saturating_sub(self.sent_us) > loss_timeout_us
    }
}

/// Statistics for one cycle. RTT figures are microseconds; the loss
/// percentage is fixed-point with two decimals (`1000` = 10.00%).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub total_packets: u64,
    pub received_packets: u64,
    pub lost_packets: u64,
    pub pending_packets: u64,
    pub duplicate_packets: u64,
    pub out_of_order_packets: u64,
    pub loss_pct_x100: u64,
    pub min_rtt_us: u64,
    pub max_rtt_us: u64,
    pub avg_rtt_us: u64,
    pub std_dev_rtt_us: u64,
    pub jitter_us: u64,
    pub p50_rtt_us: u64,
    pub p90_rtt_us: u64,
    pub p99_rtt_us: u64,
}

/// Summarizes a packet map at `now_us`.
///
/// Packets without an ACK count as lost once older than `loss_timeout` (or
/// already flagged), otherwise as pending. The map is not modified.
#[must_use]
pub fn compute(packets: &PacketMap, now_us: u64, loss_timeout: Duration) -> WindowStats {
    let loss_timeout_us = duration_us(loss_timeout);
    let mut stats = WindowStats {
        total_packets: u64::try_from(packets.len()).unwrap_or(u64::MAX),
        ..WindowStats::default()
    };

    // (seq, rtt_us, received_us) in sequence order.
    let mut samples: Vec<(u32, u64, u64)> = Vec::with_capacity(packets.len());
    for (seq, timing) in packets {
        stats.duplicate_packets = stats
            .duplicate_packets
            .saturating_add(u64::from(timing.duplicates));
        if timing.is_lost(now_us, loss_timeout_us) {
            stats.lost_packets = stats.lost_packets.saturating_add(1);
            continue;
        }
        match timing.received_us {
            Some(received_us) => {
                let rtt_us = received_us.saturating_sub(timing.sent_us);
                samples.push((*seq, rtt_us, received_us));
            }
            None => {
                stats.pending_packets = stats.pending_packets.saturating_add(1);
            }
        }
    }

    stats.received_packets = u64::try_from(samples.len()).unwrap_or(u64::MAX);
    stats.loss_pct_x100 = stats
        .lost_packets
        .saturating_mul(10_000)
        .checked_div(stats.total_packets)
        .unwrap_or(0);

    if samples.is_empty() {
        return stats;
    }

    let mut sum_us: u128 = 0;
    let mut min_us = u64::MAX;
    let mut max_us = 0u64;
    for (_, rtt_us, _) in &samples {
        sum_us = sum_us.saturating_add(u128::from(*rtt_us));
        min_us = min_us.min(*rtt_us);
        max_us = max_us.max(*rtt_us);
    }
    let count = u128::from(stats.received_packets);
    let mean_us = sum_us.checked_div(count).unwrap_or(0);
    stats.min_rtt_us = min_us;
    stats.max_rtt_us = max_us;
    stats.avg_rtt_us = u64::try_from(mean_us).unwrap_or(u64::MAX);

    let mut squares: u128 = 0;
    for (_, rtt_us, _) in &samples {
        let delta = u128::from(*rtt_us).abs_diff(mean_us);
        squares = squares.saturating_add(delta.saturating_mul(delta));
    }
    let variance = squares.checked_div(count).unwrap_or(0);
    stats.std_dev_rtt_us = u64::try_from(variance.isqrt()).unwrap_or(u64::MAX);

    let mut jitter_sum: u128 = 0;
    for pair in samples.windows(2) {
        if let [(_, previous, _), (_, current, _)] = pair {
            jitter_sum = jitter_sum.saturating_add(u128::from(previous.abs_diff(*current)));
        }
    }
    let jitter_pairs = count.saturating_sub(1);
    stats.jitter_us = u64::try_from(jitter_sum.checked_div(jitter_pairs).unwrap_or(0))
        .unwrap_or(u64::MAX);

    stats.out_of_order_packets = count_out_of_order(&samples);

    match RttHistogram::new() {
        Ok(mut histogram) => {
            for (_, rtt_us, _) in &samples {
                if let Err(err) = histogram.record(*rtt_us) {
                    tracing::debug!("Skipping rtt sample: {}", err);
                }
            }
            let (p50, p90, p99) = histogram.percentiles();
            stats.p50_rtt_us = p50;
            stats.p90_rtt_us = p90;
            stats.p99_rtt_us = p99;
        }
        Err(err) => tracing::warn!("Percentiles unavailable: {}", err),
    }

    stats
}

/// Walks samples in arrival order; each one numbered below the highest
/// sequence already seen arrived out of order.
fn count_out_of_order(samples: &[(u32, u64, u64)]) -> u64 {
    let mut arrivals: Vec<(u64, u32)> = samples
        .iter()
        .map(|(seq, _, received_us)| (*received_us, *seq))
        .collect();
    arrivals.sort_unstable();

    let mut highest: Option<u32> = None;
    let mut out_of_order = 0u64;
    for (_, seq) in arrivals {
        match highest {
            Some(top) if seq < top => out_of_order = out_of_order.saturating_add(1),
            Some(_) | None => highest = Some(seq),
        }
    }
    out_of_order
}

fn duration_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[expect(
    clippy::float_arithmetic,
    reason = "Fixed-point values are converted once for the result payload"
)]
#[must_use]
pub fn x100_to_f64(value: u64) -> f64 {
    value as f64 / 100.0
}

#[expect(
    clippy::float_arithmetic,
    reason = "Microsecond values are converted once for the result payload"
)]
#[must_use]
pub fn micros_to_millis_f64(value: u64) -> f64 {
    value as f64 / 1000.0
}
