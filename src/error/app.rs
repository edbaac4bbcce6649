use thiserror::Error;

use super::{ConfigError, ProbeError, SinkError, TrafficSimError, ValidationError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),
    #[error("TrafficSim error: {0}")]
    TrafficSim(#[from] TrafficSimError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation<E>(error: E) -> Self
    where
        E: Into<ValidationError>,
    {
        error.into().into()
    }

    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn probe<E>(error: E) -> Self
    where
        E: Into<ProbeError>,
    {
        error.into().into()
    }

    pub fn trafficsim<E>(error: E) -> Self
    where
        E: Into<TrafficSimError>,
    {
        error.into().into()
    }

    pub fn sink<E>(error: E) -> Self
    where
        E: Into<SinkError>,
    {
        error.into().into()
    }
}
