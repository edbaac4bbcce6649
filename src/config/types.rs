use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ValidationError;

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub agent_id: Option<String>,
    pub probes: Option<String>,
    pub results: Option<String>,
    pub snapshot_poll: Option<DurationValue>,
    pub verbose: Option<bool>,
    pub no_color: Option<bool>,
    pub trafficsim: Option<TrafficSimConfig>,
    pub orchestrator: Option<OrchestratorSection>,
    /// External measurement programs keyed by probe kind (`trace`, `ping`, ...).
    pub tools: Option<BTreeMap<String, ToolConfig>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TrafficSimConfig {
    pub send_interval: Option<DurationValue>,
    pub packets_per_cycle: Option<u64>,
    pub loss_timeout: Option<DurationValue>,
    pub max_extra_wait: Option<DurationValue>,
    pub loss_threshold_pct: Option<u64>,
    pub retry_delay: Option<DurationValue>,
    pub hello_timeout: Option<DurationValue>,
    pub read_timeout: Option<DurationValue>,
    pub idle_timeout: Option<DurationValue>,
    pub teardown_timeout: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrchestratorSection {
    pub teardown_timeout: Option<DurationValue>,
    /// Length of one `interval` step in probe definitions.
    pub interval_unit: Option<DurationValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self) -> Result<Duration, ValidationError> {
        match self {
            DurationValue::Seconds(secs) => {
                if *secs == 0 {
                    Err(ValidationError::DurationZero)
                } else {
                    Ok(Duration::from_secs(*secs))
                }
            }
            DurationValue::Text(text) => super::parse_duration_value(text),
        }
    }
}
