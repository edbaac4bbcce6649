//! Desired-state input for the orchestrator.
mod snapshot;


pub use snapshot::{FileSnapshotSource, parse_snapshot};
