use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{Probe, ProbePayload};

use super::ProbeExecutor;
use super::measured::request_for;
use super::tool::MeasurementTool;

const MAX_SPEEDTEST_ATTEMPTS: u32 = 3;

/// Process-wide "a speed test is running" flag. Speed tests saturate the
/// link, so at most one runs at a time.
#[derive(Debug, Clone, Default)]
pub struct SpeedtestGuard {
    running: Arc<AtomicBool>,
}

/// Held while a speed test runs; releases the guard on drop.
#[derive(Debug)]
pub struct SpeedtestPermit {
    running: Arc<AtomicBool>,
}

impl SpeedtestGuard {
    #[must_use]
    pub fn try_acquire(&self) -> Option<SpeedtestPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SpeedtestPermit {
                running: Arc::clone(&self.running),
            })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SpeedtestPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// One speed test per `pending` arm. Gives up after three failed attempts
/// until the control plane re-arms the probe with a new `pending` value.
pub struct SpeedtestExecutor {
    tool: Arc<dyn MeasurementTool>,
    guard: SpeedtestGuard,
    armed_for: Option<DateTime<Utc>>,
    completed: bool,
    failures: u32,
}

impl SpeedtestExecutor {
    #[must_use]
    pub fn new(tool: Arc<dyn MeasurementTool>, guard: SpeedtestGuard) -> Self {
        Self {
            tool,
            guard,
            armed_for: None,
            completed: false,
            failures: 0,
        }
    }

    const fn is_inert(&self) -> bool {
        self.failures >= MAX_SPEEDTEST_ATTEMPTS
    }

    fn rearm_if_changed(&mut self, probe: &Probe) {
        if probe.config.pending != self.armed_for {
            info!("Speedtest {} re-armed", probe.id);
            self.armed_for = probe.config.pending;
            self.completed = false;
            self.failures = 0;
        }
    }
}

#[async_trait]
impl ProbeExecutor for SpeedtestExecutor {
    async fn start(&mut self, probe: &Probe) -> ProbeResult<()> {
        self.armed_for = probe.config.pending;
        request_for(probe, false).map(|_| ())
    }

    async fn tick(&mut self, probe: &Probe, triggered: bool) -> ProbeResult<Option<ProbePayload>> {
        self.rearm_if_changed(probe);
        if self.completed || self.is_inert() {
            return Ok(None);
        }
        let Some(_permit) = self.guard.try_acquire() else {
            return Err(ProbeError::SpeedtestBusy);
        };
        let request = request_for(probe, triggered)?;
        match self.tool.measure(&request).await {
            Ok(output) => {
                self.completed = true;
                Ok(Some(ProbePayload::Measurement(output)))
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                if self.is_inert() {
                    warn!(
                        "Speedtest {} failed {} times; waiting for a new schedule",
                        probe.id, self.failures
                    );
                }
                Err(err)
            }
        }
    }
}
