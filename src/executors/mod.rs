//! Executors for every probe type except TrafficSim. Each worker drives one
//! [`ProbeExecutor`]: `start`, then `tick` once per cadence, then `stop`.
mod factory;
mod measured;
mod native;
mod speedtest;
mod tool;


use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProbeResult;
use crate::probe::{Probe, ProbePayload};

pub use factory::{ExecutorFactory, StandardExecutors};
pub use measured::ToolExecutor;
pub use native::{
    InterfaceInfo, MemoryInfo, NetworkInfo, NetworkInfoExecutor, SystemInfo, SystemInfoExecutor,
};
pub use speedtest::{SpeedtestExecutor, SpeedtestGuard, SpeedtestPermit};
pub use tool::{CommandTool, MeasurementRequest, MeasurementTool, ToolCommand};

/// Trace cycles for a scheduled run.
pub const SCHEDULED_TRACE_CYCLES: u32 = 5;
/// Trace cycles when a TrafficSim loss alarm requested the run.
pub const TRIGGERED_TRACE_CYCLES: u32 = 15;

#[async_trait]
pub trait ProbeExecutor: Send {
    /// Checks the definition before the first tick.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe cannot be run by this executor.
    async fn start(&mut self, _probe: &Probe) -> ProbeResult<()> {
        Ok(())
    }

    /// Runs one measurement. `Ok(None)` means nothing to report this pass.
    ///
    /// # Errors
    ///
    /// Returns an error when the measurement fails; the worker logs it and
    /// tries again next pass.
    async fn tick(&mut self, probe: &Probe, triggered: bool) -> ProbeResult<Option<ProbePayload>>;

    /// Delay between ticks. `unit` is the length of one configured interval
    /// step (a minute in production).
    fn cadence(&self, probe: &Probe, unit: Duration) -> Duration {
        unit.saturating_mul(u32::try_from(probe.config.interval.max(1)).unwrap_or(u32::MAX))
    }

    async fn stop(&mut self) {}
}
