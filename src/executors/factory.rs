use std::sync::Arc;

use crate::probe::ProbeType;

use super::native::{NetworkInfoExecutor, SystemInfoExecutor};
use super::speedtest::{SpeedtestExecutor, SpeedtestGuard};
use super::tool::MeasurementTool;
use super::{ProbeExecutor, ToolExecutor};

/// Builds executors for probe workers. TrafficSim probes run sessions, not
/// executors, so factories return `None` for them.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, kind: ProbeType) -> Option<Box<dyn ProbeExecutor>>;
}

/// Native executors for system and network info; everything else goes
/// through one shared [`MeasurementTool`].
#[derive(Clone)]
pub struct StandardExecutors {
    tool: Arc<dyn MeasurementTool>,
    speedtest: SpeedtestGuard,
}

impl std::fmt::Debug for StandardExecutors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardExecutors")
            .field("speedtest", &self.speedtest)
            .finish_non_exhaustive()
    }
}

impl StandardExecutors {
    #[must_use]
    pub fn new(tool: Arc<dyn MeasurementTool>) -> Self {
        Self {
            tool,
            speedtest: SpeedtestGuard::default(),
        }
    }

    #[must_use]
    pub fn speedtest_guard(&self) -> SpeedtestGuard {
        self.speedtest.clone()
    }
}

impl ExecutorFactory for StandardExecutors {
    fn create(&self, kind: ProbeType) -> Option<Box<dyn ProbeExecutor>> {
        match kind {
            ProbeType::Trace
            | ProbeType::Ping
            | ProbeType::Throughput
            | ProbeType::SpeedtestServers => {
                Some(Box::new(ToolExecutor::new(kind, Arc::clone(&self.tool))))
            }
            ProbeType::Speedtest => Some(Box::new(SpeedtestExecutor::new(
                Arc::clone(&self.tool),
                self.speedtest.clone(),
            ))),
            ProbeType::SystemInfo => Some(Box::new(SystemInfoExecutor)),
            ProbeType::NetworkInfo => Some(Box::new(NetworkInfoExecutor)),
            ProbeType::TrafficSim => None,
        }
    }
}
