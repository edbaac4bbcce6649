use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::executors::{ExecutorFactory, ProbeExecutor};
use crate::probe::{Probe, ProbeData, ProbeId, ProbePayload, ProbeType};
use crate::shutdown::StopSignal;
use crate::sinks::ResultSender;
use crate::trafficsim::TraceTrigger;

use super::registry::ProbeRegistry;

/// Runs the matching TRACE probe once, flagged as triggered. Each run is
/// owned here and ends early when the trace probe's entry stops or the
/// trigger is shut down.
pub struct RegistryTraceTrigger {
    registry: Arc<ProbeRegistry>,
    executors: Arc<dyn ExecutorFactory>,
    results: ResultSender,
    stop: StopSignal,
    runs: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for RegistryTraceTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryTraceTrigger")
            .field("stopped", &self.stop.is_triggered())
            .finish_non_exhaustive()
    }
}

impl RegistryTraceTrigger {
    #[must_use]
    pub fn new(
        registry: Arc<ProbeRegistry>,
        executors: Arc<dyn ExecutorFactory>,
        results: ResultSender,
    ) -> Self {
        let (stop, _) = StopSignal::new();
        Self {
            registry,
            executors,
            results,
            stop,
            runs: Mutex::new(JoinSet::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Triggered runs that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let mut runs = self.runs();
        while runs.try_join_next().is_some() {}
        runs.len()
    }

    /// Refuses new runs, cancels the ones in flight and waits for them
    /// within `limit`, aborting whatever is left.
    pub async fn shutdown(&self, limit: Duration) {
        self.stop.trigger();
        let mut runs = std::mem::take(&mut *self.runs());
        let pending = runs.len();
        let drained = tokio::time::timeout(limit, async {
            while let Some(joined) = runs.join_next().await {
                if let Err(err) = joined
                    && !err.is_cancelled()
                {
                    warn!("Triggered trace run failed: {}", err);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Triggered trace runs did not stop within {}ms; aborting",
                limit.as_millis()
            );
            runs.shutdown().await;
        }
        if pending > 0 {
            debug!("Stopped {} triggered trace runs", pending);
        }
    }
}

impl TraceTrigger for RegistryTraceTrigger {
    fn trigger(&self, source: &ProbeId, target: &str) -> bool {
        if self.stop.is_triggered() {
            return false;
        }
        let Some(trace) = self.registry.find_probe(ProbeType::Trace, target) else {
            return false;
        };
        let Some(mut entry_stop) = self.registry.stop_listener(&trace.id) else {
            return false;
        };
        let Some(mut executor) = self.executors.create(ProbeType::Trace) else {
            return false;
        };
        let mut shutdown = self.stop.subscribe();
        let results = self.results.clone();
        let source = source.clone();

        let mut runs = self.runs();
        while runs.try_join_next().is_some() {}
        runs.spawn(async move {
            let outcome = tokio::select! {
                () = entry_stop.wait() => None,
                () = shutdown.wait() => None,
                payload = run_once(executor.as_mut(), &trace, &source) => payload,
            };
            executor.stop().await;
            if entry_stop.is_stopped() || shutdown.is_stopped() {
                debug!("Triggered trace {} for {} cancelled", trace.id, source);
            } else if let Some(payload) = outcome {
                info!("Triggered trace {} for {} finished", trace.id, source);
                results.emit(ProbeData::new(trace.id.clone(), true, payload));
            }
        });
        true
    }
}

async fn run_once(
    executor: &mut dyn ProbeExecutor,
    trace: &Probe,
    source: &ProbeId,
) -> Option<ProbePayload> {
    if let Err(err) = executor.start(trace).await {
        warn!("Triggered trace {} for {} could not start: {}", trace.id, source, err);
        return None;
    }
    match executor.tick(trace, true).await {
        Ok(payload) => payload,
        Err(err) => {
            warn!("Triggered trace {} for {} failed: {}", trace.id, source, err);
            None
        }
    }
}
