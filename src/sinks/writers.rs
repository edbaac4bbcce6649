use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::error::SinkError;
use crate::probe::ProbeData;

/// Destination for finished probe results.
#[async_trait]
pub trait ResultSink: Send {
    /// Delivers one record.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be serialized or written.
    async fn deliver(&mut self, data: &ProbeData) -> Result<(), SinkError>;

    /// Flushes buffered output.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying writer fails.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes one JSON document per line to a file or stdout.
pub struct JsonLinesSink {
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    label: String,
}

impl std::fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl JsonLinesSink {
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            writer: BufWriter::new(Box::new(tokio::io::stdout())),
            label: "stdout".to_owned(),
        }
    }

    /// Opens `path` for appending, or stdout when `path` is `-`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened.
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        if path == Path::new("-") {
            return Ok(Self::stdout());
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| SinkError::Open {
                path: PathBuf::from(path),
                source,
            })?;
        Ok(Self {
            writer: BufWriter::new(Box::new(file)),
            label: path.display().to_string(),
        })
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn deliver(&mut self, data: &ProbeData) -> Result<(), SinkError> {
        let mut line =
            serde_json::to_vec(data).map_err(|source| SinkError::Serialize { source })?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|source| SinkError::Write { source })?;
        // Records are sparse; keep the output tail-able.
        self.writer
            .flush()
            .await
            .map_err(|source| SinkError::Write { source })
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer
            .flush()
            .await
            .map_err(|source| SinkError::Write { source })
    }
}

/// Keeps delivered records in memory. Useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ProbeData>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<ProbeData> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn deliver(&mut self, data: &ProbeData) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.clone());
        Ok(())
    }
}
