use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{Probe, ProbePayload, ProbeType};

use super::tool::{MeasurementRequest, MeasurementTool};
use super::{ProbeExecutor, SCHEDULED_TRACE_CYCLES, TRIGGERED_TRACE_CYCLES};

/// Speedtest server lists change rarely; refreshed every twelve hours.
const SPEEDTEST_SERVERS_UNITS: u32 = 720;

/// Runs trace, ping, throughput and speedtest-server measurements through a
/// [`MeasurementTool`] and passes the output through unchanged.
pub struct ToolExecutor {
    kind: ProbeType,
    tool: Arc<dyn MeasurementTool>,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(kind: ProbeType, tool: Arc<dyn MeasurementTool>) -> Self {
        Self { kind, tool }
    }
}

pub(super) fn primary_target(probe: &Probe) -> ProbeResult<Option<String>> {
    if !probe.kind.requires_target() {
        return Ok(probe.primary_target().map(|target| target.target.clone()));
    }
    probe
        .primary_target()
        .map(|target| target.target.trim())
        .filter(|target| !target.is_empty())
        .map(|target| Some(target.to_owned()))
        .ok_or_else(|| ProbeError::MissingTarget {
            probe: probe.id.to_string(),
            kind: probe.kind,
        })
}

pub(super) fn request_for(probe: &Probe, triggered: bool) -> ProbeResult<MeasurementRequest> {
    Ok(MeasurementRequest {
        kind: probe.kind,
        target: primary_target(probe)?,
        count: probe.config.count,
        duration: probe.config.duration,
        cycles: if triggered {
            TRIGGERED_TRACE_CYCLES
        } else {
            SCHEDULED_TRACE_CYCLES
        },
        triggered,
    })
}

#[async_trait]
impl ProbeExecutor for ToolExecutor {
    async fn start(&mut self, probe: &Probe) -> ProbeResult<()> {
        if probe.kind != self.kind {
            return Err(ProbeError::UnsupportedType { kind: probe.kind });
        }
        primary_target(probe).map(|_| ())
    }

    async fn tick(&mut self, probe: &Probe, triggered: bool) -> ProbeResult<Option<ProbePayload>> {
        let request = request_for(probe, triggered)?;
        let output = self.tool.measure(&request).await?;
        Ok(Some(ProbePayload::Measurement(output)))
    }

    fn cadence(&self, probe: &Probe, unit: Duration) -> Duration {
        if self.kind == ProbeType::SpeedtestServers {
            return unit.saturating_mul(SPEEDTEST_SERVERS_UNITS);
        }
        unit.saturating_mul(u32::try_from(probe.config.interval.max(1)).unwrap_or(u32::MAX))
    }
}
