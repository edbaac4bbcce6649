use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::probe::Probe;
use crate::shutdown::ShutdownReceiver;

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    List(Vec<Probe>),
    Wrapped { probes: Vec<Probe> },
}

/// Parses a probe snapshot: either a bare JSON array of probes or an
/// object with a `probes` array.
///
/// # Errors
///
/// Returns the JSON error when the document matches neither shape.
pub fn parse_snapshot(content: &str) -> Result<Vec<Probe>, serde_json::Error> {
    let document: SnapshotDocument = serde_json::from_str(content)?;
    Ok(match document {
        SnapshotDocument::List(probes) | SnapshotDocument::Wrapped { probes } => probes,
    })
}

/// Polls a JSON file holding the full desired probe list and forwards each
/// snapshot that parses and differs from the last one forwarded.
#[derive(Debug)]
pub struct FileSnapshotSource {
    path: PathBuf,
    poll: Duration,
    last: Option<Vec<Probe>>,
    last_error: Option<String>,
}

impl FileSnapshotSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            poll,
            last: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file once.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed; the previous
    /// snapshot stays current.
    pub async fn load(&self) -> Result<Vec<Probe>, ConfigError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| ConfigError::ReadSnapshot {
                path: self.path.clone(),
                source: err,
            })?;
        parse_snapshot(&content).map_err(|err| ConfigError::ParseSnapshot {
            path: self.path.clone(),
            source: err,
        })
    }

    /// Returns the snapshot when it changed since the last call that
    /// returned one. Read and parse failures are logged once per distinct
    /// message and yield `None`.
    pub async fn poll_changed(&mut self) -> Option<Vec<Probe>> {
        let snapshot = match self.load().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let message = err.to_string();
                if self.last_error.as_deref() != Some(message.as_str()) {
                    warn!("{}; keeping the previous probe list", message);
                    self.last_error = Some(message);
                }
                return None;
            }
        };
        self.last_error = None;
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Forwards changed snapshots until shutdown or until the receiver is
    /// dropped.
    pub async fn run(mut self, tx: mpsc::Sender<Vec<Probe>>, mut shutdown: ShutdownReceiver) {
        let mut interval = tokio::time::interval(self.poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "Watching {} for probe changes every {:?}",
            self.path.display(),
            self.poll
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let Some(snapshot) = self.poll_changed().await else {
                        continue;
                    };
                    debug!("Forwarding snapshot with {} probes", snapshot.len());
                    if tx.send(snapshot).await.is_err() {
                        debug!("Snapshot consumer closed; stopping poller");
                        break;
                    }
                }
            }
        }
    }
}
