use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to open result output '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize probe data: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to write probe data: {source}")]
    Write {
        #[source]
        source: std::io::Error,
    },
    #[error("Result channel closed.")]
    ChannelClosed,
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
