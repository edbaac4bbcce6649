use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::probe::{Probe, ProbeId, ProbeType, strip_port};
use crate::shutdown::{StopListener, StopSignal};

/// Registry entry for one probe id.
#[derive(Debug)]
pub struct ProbeWorker {
    pub probe: Probe,
    pub to_remove: bool,
    pub generation: u64,
    stop: StopSignal,
    completion: Option<JoinHandle<()>>,
}

/// What the orchestrator needs to tear a worker down.
#[derive(Debug)]
pub(crate) struct Teardown {
    pub(crate) generation: u64,
    pub(crate) kind: ProbeType,
    pub(crate) completion: Option<JoinHandle<()>>,
}

/// Concurrent map from probe id to worker state. Readers never block the
/// orchestrator; no operation spans more than one entry.
#[derive(Debug)]
pub struct ProbeRegistry {
    workers: DashMap<ProbeId, ProbeWorker>,
    next_generation: AtomicU64,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self {
            workers: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }
}

impl ProbeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &ProbeId) -> bool {
        self.workers.contains_key(id)
    }

    #[must_use]
    pub fn probe(&self, id: &ProbeId) -> Option<Probe> {
        self.workers.get(id).map(|worker| worker.probe.clone())
    }

    #[must_use]
    pub fn generation(&self, id: &ProbeId) -> Option<u64> {
        self.workers.get(id).map(|worker| worker.generation)
    }

    /// Every id in the registry, including entries still shutting down.
    #[must_use]
    pub fn ids(&self) -> Vec<ProbeId> {
        let mut ids: Vec<ProbeId> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of entries that are not pending removal.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ProbeId> {
        let mut ids: Vec<ProbeId> = self
            .workers
            .iter()
            .filter(|entry| !entry.to_remove)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// First live probe of `kind` that targets the host of `target`; any
    /// port suffix is ignored on both sides.
    #[must_use]
    pub fn find_probe(&self, kind: ProbeType, target: &str) -> Option<Probe> {
        let host = strip_port(target);
        self.workers
            .iter()
            .filter(|entry| !entry.to_remove && entry.probe.kind == kind)
            .find(|entry| entry.probe.targets_host(host))
            .map(|entry| entry.probe.clone())
    }

    /// The definition a worker of `generation` should run next, or `None`
    /// once it was replaced or flagged for removal.
    #[must_use]
    pub fn current_probe(&self, id: &ProbeId, generation: u64) -> Option<Probe> {
        self.workers
            .get(id)
            .filter(|worker| worker.generation == generation && !worker.to_remove)
            .map(|worker| worker.probe.clone())
    }

    /// Listener on a live entry's stop signal. It fires when the entry is
    /// flagged, replaced or deleted.
    pub(crate) fn stop_listener(&self, id: &ProbeId) -> Option<StopListener> {
        self.workers
            .get(id)
            .filter(|worker| !worker.to_remove)
            .map(|worker| worker.stop.subscribe())
    }

    pub(crate) fn state(&self, id: &ProbeId) -> Option<(Probe, bool)> {
        self.workers
            .get(id)
            .map(|worker| (worker.probe.clone(), worker.to_remove))
    }

    /// Stores a fresh entry and returns its generation.
    pub(crate) fn insert(&self, probe: Probe, stop: StopSignal) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let id = probe.id.clone();
        let worker = ProbeWorker {
            probe,
            to_remove: false,
            generation,
            stop,
            completion: None,
        };
        if let Some(previous) = self.workers.insert(id, worker) {
            previous.stop.trigger();
        }
        generation
    }

    pub(crate) fn set_completion(&self, id: &ProbeId, generation: u64, handle: JoinHandle<()>) {
        if let Some(mut worker) = self.workers.get_mut(id)
            && worker.generation == generation
        {
            worker.completion = Some(handle);
        }
    }

    pub(crate) fn replace_definition(&self, probe: Probe) -> bool {
        match self.workers.get_mut(&probe.id) {
            Some(mut worker) => {
                worker.probe = probe;
                true
            }
            None => false,
        }
    }

    /// Flags the entry for removal and fires its stop signal.
    pub(crate) fn mark_removed(&self, id: &ProbeId) -> Option<ProbeType> {
        let mut worker = self.workers.get_mut(id)?;
        worker.to_remove = true;
        worker.stop.trigger();
        Some(worker.probe.kind)
    }

    /// Flags the entry, fires its stop signal and hands over the join handle.
    pub(crate) fn begin_teardown(&self, id: &ProbeId) -> Option<Teardown> {
        let mut worker = self.workers.get_mut(id)?;
        worker.to_remove = true;
        worker.stop.trigger();
        Some(Teardown {
            generation: worker.generation,
            kind: worker.probe.kind,
            completion: worker.completion.take(),
        })
    }

    /// Deletes the entry if it still belongs to `generation`.
    pub(crate) fn remove_generation(&self, id: &ProbeId, generation: u64) -> bool {
        self.workers
            .remove_if(id, |_, worker| worker.generation == generation)
            .is_some()
    }

    /// Called by an exiting worker: deletes its own entry only when it was
    /// flagged for removal and not replaced meanwhile.
    pub(crate) fn remove_if_retired(&self, id: &ProbeId, generation: u64) -> bool {
        self.workers
            .remove_if(id, |_, worker| worker.generation == generation && worker.to_remove)
            .is_some()
    }
}
