use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executors::{NetworkInfo, SystemInfo};
use crate::trafficsim::TrafficSimReport;

use super::ProbeId;

/// Result record handed to the result sink. Fire-and-forget after hand-off.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeData {
    pub id: String,
    #[serde(rename = "probe")]
    pub probe_id: ProbeId,
    pub triggered: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub data: ProbePayload,
}

impl ProbeData {
    #[must_use]
    pub fn new(probe_id: ProbeId, triggered: bool, data: ProbePayload) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            probe_id,
            triggered,
            created_at: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProbePayload {
    TrafficSim(Box<TrafficSimReport>),
    SystemInfo(SystemInfo),
    NetworkInfo(NetworkInfo),
    /// Output of an external measurement tool, passed through as-is.
    Measurement(serde_json::Value),
}
