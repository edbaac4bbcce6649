use crate::probe::{Probe, ProbeId, ProbeType};

/// How a re-presented probe differs from the running definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    Unchanged,
    /// Worker keeps running and picks the new definition up on its next pass.
    Definition,
    /// Only a TrafficSim server's admitted peers changed.
    AllowList,
    /// Socket-level identity changed; the worker must be replaced.
    Restart,
}

pub(crate) fn classify(current: &Probe, next: &Probe) -> Change {
    if current == next {
        return Change::Unchanged;
    }
    if current.kind != next.kind {
        return Change::Restart;
    }
    if next.kind != ProbeType::TrafficSim {
        return Change::Definition;
    }
    if current.config.server != next.config.server {
        return Change::Restart;
    }
    let endpoint = |probe: &Probe| {
        probe
            .primary_target()
            .map(|target| (target.target.clone(), target.agent.clone()))
    };
    if endpoint(current) != endpoint(next) {
        return Change::Restart;
    }
    if next.config.server && current.peer_agents() != next.peer_agents() {
        return Change::AllowList;
    }
    Change::Definition
}

/// Outcome of one reconcile pass, by probe id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<ProbeId>,
    pub restarted: Vec<ProbeId>,
    pub updated: Vec<ProbeId>,
    pub removed: Vec<ProbeId>,
    pub rejected: Vec<ProbeId>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.restarted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.rejected.is_empty()
    }
}
