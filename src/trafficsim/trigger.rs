use crate::probe::ProbeId;

/// Escalation hook invoked when a cycle's loss exceeds the threshold.
pub trait TraceTrigger: Send + Sync {
    /// Starts a triggered trace towards `target` (a `host:port` string) on
    /// behalf of `source`. Returns false when no trace probe covers the host
    /// or triggering was shut down.
    fn trigger(&self, source: &ProbeId, target: &str) -> bool;
}
