use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque probe identifier assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeId(String);

impl ProbeId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProbeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ProbeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of an agent, used as `src`/`dst` on the TrafficSim wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeType {
    #[serde(rename = "TRACE", alias = "MTR")]
    Trace,
    #[serde(rename = "THROUGHPUT", alias = "RPERF")]
    Throughput,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "SPEEDTEST")]
    Speedtest,
    #[serde(rename = "SPEEDTEST_SERVERS")]
    SpeedtestServers,
    #[serde(rename = "NETWORKINFO", alias = "NETINFO")]
    NetworkInfo,
    #[serde(rename = "SYSTEMINFO")]
    SystemInfo,
    #[serde(rename = "TRAFFICSIM")]
    TrafficSim,
}

impl ProbeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ProbeType::Trace => "TRACE",
            ProbeType::Throughput => "THROUGHPUT",
            ProbeType::Ping => "PING",
            ProbeType::Speedtest => "SPEEDTEST",
            ProbeType::SpeedtestServers => "SPEEDTEST_SERVERS",
            ProbeType::NetworkInfo => "NETWORKINFO",
            ProbeType::SystemInfo => "SYSTEMINFO",
            ProbeType::TrafficSim => "TRAFFICSIM",
        }
    }

    /// Whether the probe type measures against `config.target[0]`.
    #[must_use]
    pub const fn requires_target(self) -> bool {
        match self {
            ProbeType::Trace
            | ProbeType::Throughput
            | ProbeType::Ping
            | ProbeType::Speedtest
            | ProbeType::TrafficSim => true,
            ProbeType::SpeedtestServers | ProbeType::NetworkInfo | ProbeType::SystemInfo => false,
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeTarget {
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub target: Vec<ProbeTarget>,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub count: u64,
    /// Minutes between scheduled runs.
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub server: bool,
    #[serde(default)]
    pub pending: Option<DateTime<Utc>>,
}

/// Immutable desired-state description of one measurement task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub id: ProbeId,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub config: ProbeConfig,
}

impl Probe {
    #[must_use]
    pub fn primary_target(&self) -> Option<&ProbeTarget> {
        self.config.target.first()
    }

    /// Agents allowed to talk to a server-role TrafficSim probe: every target
    /// after the first (which carries the listen address).
    #[must_use]
    pub fn peer_agents(&self) -> BTreeSet<AgentId> {
        self.config
            .target
            .iter()
            .skip(1)
            .filter_map(|target| target.agent.clone())
            .filter(|agent| !agent.is_empty())
            .collect()
    }

    /// Whether `host` (port already stripped) is one of this probe's targets.
    #[must_use]
    pub fn targets_host(&self, host: &str) -> bool {
        self.config
            .target
            .iter()
            .any(|target| super::strip_port(&target.target) == host)
    }
}
