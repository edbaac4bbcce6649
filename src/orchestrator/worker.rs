use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::executors::ProbeExecutor;
use crate::probe::{ProbeData, ProbeId};
use crate::shutdown::StopListener;
use crate::sinks::ResultSender;
use crate::trafficsim::ListenerRegistry;

use super::registry::ProbeRegistry;

/// Loop for every non-TrafficSim probe: measure, emit, sleep, re-read the
/// definition. Exits when stopped or when its entry was replaced.
pub(crate) async fn run_executor(
    registry: Arc<ProbeRegistry>,
    results: ResultSender,
    mut executor: Box<dyn ProbeExecutor>,
    id: ProbeId,
    generation: u64,
    unit: Duration,
    mut stop: StopListener,
) {
    let Some(mut probe) = registry.current_probe(&id, generation) else {
        return;
    };
    let started = tokio::select! {
        () = stop.wait() => None,
        started = executor.start(&probe) => Some(started),
    };
    match started {
        None => {}
        Some(Err(err)) => {
            warn!("Probe {} ({}) failed to start: {}", id, probe.kind, err);
            registry.remove_generation(&id, generation);
            return;
        }
        Some(Ok(())) => loop {
            let outcome = tokio::select! {
                () = stop.wait() => break,
                outcome = executor.tick(&probe, false) => outcome,
            };
            match outcome {
                Ok(Some(payload)) => results.emit(ProbeData::new(id.clone(), false, payload)),
                Ok(None) => trace!("Probe {} had nothing to report", id),
                Err(err) => warn!("Probe {} ({}) measurement failed: {}", id, probe.kind, err),
            }

            let delay = executor.cadence(&probe, unit);
            tokio::select! {
                () = stop.wait() => break,
                () = tokio::time::sleep(delay) => {}
            }
            match registry.current_probe(&id, generation) {
                Some(next) => probe = next,
                None => break,
            }
        },
    }
    executor.stop().await;
    registry.remove_if_retired(&id, generation);
    debug!("Probe {} worker (generation {}) exited", id, generation);
}

/// Holds a server-role TrafficSim probe's listener lease until stopped.
pub(crate) async fn hold_listener(
    registry: Arc<ProbeRegistry>,
    listeners: Arc<ListenerRegistry>,
    id: ProbeId,
    generation: u64,
    mut stop: StopListener,
) {
    stop.wait().await;
    listeners.release(&id).await;
    registry.remove_if_retired(&id, generation);
    debug!("TrafficSim server {} (generation {}) released", id, generation);
}
