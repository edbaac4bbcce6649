//! Probe orchestration: reconciles desired-state snapshots into running
//! workers, one per probe id.
mod reconcile;
mod registry;
mod trigger;
mod worker;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppResult, ProbeError};
use crate::executors::ExecutorFactory;
use crate::probe::{AgentId, Probe, ProbeId, ProbeType, split_host_port};
use crate::shutdown::{ShutdownReceiver, StopSignal};
use crate::sinks::ResultSender;
use crate::trafficsim::{ClientSession, ListenerRegistry, TraceTrigger, TrafficSimSettings};

use reconcile::{Change, classify};

pub use reconcile::ReconcileSummary;
pub use registry::{ProbeRegistry, ProbeWorker};
pub use trigger::RegistryTraceTrigger;

const DEFAULT_WORKER_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_INTERVAL_UNIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub local_agent: AgentId,
    pub trafficsim: TrafficSimSettings,
    /// Bound on waiting for a replaced or removed worker to exit.
    pub teardown_timeout: Duration,
    /// Length of one `interval` step of a probe definition.
    pub interval_unit: Duration,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn new(local_agent: AgentId) -> Self {
        Self {
            local_agent,
            trafficsim: TrafficSimSettings::default(),
            teardown_timeout: DEFAULT_WORKER_TEARDOWN_TIMEOUT,
            interval_unit: DEFAULT_INTERVAL_UNIT,
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ProbeRegistry>,
    listeners: Arc<ListenerRegistry>,
    executors: Arc<dyn ExecutorFactory>,
    results: ResultSender,
    trigger: Arc<RegistryTraceTrigger>,
    reconcile_lock: Mutex<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        executors: Arc<dyn ExecutorFactory>,
        results: ResultSender,
    ) -> Self {
        let registry = Arc::new(ProbeRegistry::new());
        let listeners = Arc::new(ListenerRegistry::new(
            config.local_agent.clone(),
            config.trafficsim.clone(),
        ));
        let trigger = Arc::new(RegistryTraceTrigger::new(
            Arc::clone(&registry),
            Arc::clone(&executors),
            results.clone(),
        ));
        Self {
            config,
            registry,
            listeners,
            executors,
            results,
            trigger,
            reconcile_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ProbeRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Applies one full desired-state snapshot. Passes are serialized; the
    /// registry stays readable throughout.
    pub async fn reconcile(&self, snapshot: Vec<Probe>) -> ReconcileSummary {
        let _pass = self.reconcile_lock.lock().await;
        let mut summary = ReconcileSummary::default();
        let mut desired: HashSet<ProbeId> = HashSet::new();

        for probe in snapshot {
            if !desired.insert(probe.id.clone()) {
                warn!("Probe {} listed twice in one snapshot; keeping the first", probe.id);
                continue;
            }
            let id = probe.id.clone();
            match self.registry.state(&id) {
                None => self.start_into(probe, &mut summary.started, &mut summary.rejected).await,
                Some((_, true)) => {
                    self.teardown(&id).await;
                    self.start_into(probe, &mut summary.started, &mut summary.rejected)
                        .await;
                }
                Some((current, false)) => match classify(&current, &probe) {
                    Change::Unchanged => {}
                    Change::Definition => {
                        if self.registry.replace_definition(probe) {
                            summary.updated.push(id);
                        }
                    }
                    Change::AllowList => {
                        let peers = probe.peer_agents();
                        if !self.listeners.update_peers(&id, peers).await {
                            warn!("TrafficSim server {} holds no listener to update", id);
                        }
                        if self.registry.replace_definition(probe) {
                            summary.updated.push(id);
                        }
                    }
                    Change::Restart => {
                        info!("Probe {} changed endpoint or type; restarting", id);
                        self.teardown(&id).await;
                        self.start_into(probe, &mut summary.restarted, &mut summary.rejected)
                            .await;
                    }
                },
            }
        }

        let mut torn_down = Vec::new();
        for id in self.registry.active_ids() {
            if desired.contains(&id) {
                continue;
            }
            if self.registry.probe(&id).is_some_and(|probe| probe.kind == ProbeType::TrafficSim) {
                torn_down.push(id);
            } else if self.registry.mark_removed(&id).is_some() {
                debug!("Probe {} flagged for removal", id);
                summary.removed.push(id);
            }
        }
        join_all(torn_down.iter().map(|id| self.teardown(id))).await;
        summary.removed.extend(torn_down);

        if !summary.is_empty() {
            info!(
                "Reconciled: {} started, {} restarted, {} updated, {} removed, {} rejected",
                summary.started.len(),
                summary.restarted.len(),
                summary.updated.len(),
                summary.removed.len(),
                summary.rejected.len()
            );
        }
        summary
    }

    /// Reconciles every snapshot received until shutdown, then tears all
    /// workers down.
    pub async fn run(&self, mut snapshots: mpsc::Receiver<Vec<Probe>>, mut shutdown: ShutdownReceiver) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                snapshot = snapshots.recv() => match snapshot {
                    Some(snapshot) => {
                        self.reconcile(snapshot).await;
                    }
                    None => {
                        debug!("Snapshot source closed; running until shutdown");
                        drop(shutdown.recv().await);
                        break;
                    }
                },
            }
        }
        self.shutdown_all().await;
    }

    /// Stops every worker concurrently, cancels triggered trace runs and
    /// closes all listeners.
    pub async fn shutdown_all(&self) {
        let _pass = self.reconcile_lock.lock().await;
        let ids = self.registry.ids();
        join_all(ids.iter().map(|id| self.teardown(id))).await;
        self.trigger.shutdown(self.config.teardown_timeout).await;
        self.listeners.release_all().await;
        info!("Stopped {} probe workers", ids.len());
    }

    async fn start_into(&self, probe: Probe, started: &mut Vec<ProbeId>, rejected: &mut Vec<ProbeId>) {
        let id = probe.id.clone();
        let kind = probe.kind;
        match self.start(probe).await {
            Ok(generation) => {
                debug!("Probe {} ({}) started as generation {}", id, kind, generation);
                started.push(id);
            }
            Err(err) => {
                warn!("Probe {} ({}) rejected: {}", id, kind, err);
                rejected.push(id);
            }
        }
    }

    /// Validates `probe`, registers it and spawns its worker.
    async fn start(&self, probe: Probe) -> AppResult<u64> {
        let id = probe.id.clone();
        if probe.kind == ProbeType::TrafficSim && probe.config.server {
            return self.start_listener(probe).await;
        }

        let (stop, listener) = StopSignal::new();
        if probe.kind == ProbeType::TrafficSim {
            let session = ClientSession::new(
                &probe,
                self.config.local_agent.clone(),
                self.config.trafficsim.clone(),
                self.results.clone(),
            )?
            .with_trigger(Arc::clone(&self.trigger) as Arc<dyn TraceTrigger>);
            let generation = self.registry.insert(probe, stop);
            let handle = tokio::spawn(session.run(listener));
            self.registry.set_completion(&id, generation, handle);
            return Ok(generation);
        }

        let executor = self
            .executors
            .create(probe.kind)
            .ok_or(ProbeError::UnsupportedType { kind: probe.kind })?;
        if probe.kind.requires_target()
            && probe
                .primary_target()
                .is_none_or(|target| target.target.trim().is_empty())
        {
            return Err(ProbeError::MissingTarget {
                probe: id.to_string(),
                kind: probe.kind,
            }
            .into());
        }
        let generation = self.registry.insert(probe, stop);
        let handle = tokio::spawn(worker::run_executor(
            Arc::clone(&self.registry),
            self.results.clone(),
            executor,
            id.clone(),
            generation,
            self.config.interval_unit,
            listener,
        ));
        self.registry.set_completion(&id, generation, handle);
        Ok(generation)
    }

    async fn start_listener(&self, probe: Probe) -> AppResult<u64> {
        let id = probe.id.clone();
        let primary = probe
            .primary_target()
            .ok_or_else(|| ProbeError::MissingTarget {
                probe: id.to_string(),
                kind: probe.kind,
            })?;
        let bind = split_host_port(&primary.target)?;
        let peers = probe.peer_agents();
        self.listeners.acquire(&id, &bind, peers).await?;

        let (stop, listener) = StopSignal::new();
        let generation = self.registry.insert(probe, stop);
        let handle = tokio::spawn(worker::hold_listener(
            Arc::clone(&self.registry),
            Arc::clone(&self.listeners),
            id.clone(),
            generation,
            listener,
        ));
        self.registry.set_completion(&id, generation, handle);
        Ok(generation)
    }

    /// Stops the worker for `id`, waits for it within the teardown bound
    /// (aborting on expiry), releases any listener it held and deletes the
    /// entry.
    async fn teardown(&self, id: &ProbeId) {
        let Some(teardown) = self.registry.begin_teardown(id) else {
            return;
        };
        if let Some(completion) = teardown.completion {
            await_bounded(id, completion, self.config.teardown_timeout).await;
        }
        if teardown.kind == ProbeType::TrafficSim && self.listeners.release(id).await {
            debug!("TrafficSim server {} listener lease released", id);
        }
        self.registry.remove_generation(id, teardown.generation);
        debug!("Probe {} torn down", id);
    }
}

async fn await_bounded(id: &ProbeId, mut completion: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut completion).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Probe {} worker failed: {}", id, err),
        Err(_elapsed) => {
            warn!(
                "Probe {} worker did not stop within {}ms; aborting",
                id,
                limit.as_millis()
            );
            completion.abort();
            if let Err(err) = completion.await
                && !err.is_cancelled()
            {
                warn!("Probe {} worker failed: {}", id, err);
            }
        }
    }
}
