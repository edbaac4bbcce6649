use thiserror::Error;

use crate::probe::ProbeType;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe {probe} ({kind}) has no target.")]
    MissingTarget { probe: String, kind: ProbeType },
    #[error("Probe {probe} has no peer agent for its TrafficSim target.")]
    MissingPeerAgent { probe: String },
    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget {
        target: String,
        reason: &'static str,
    },
    #[error("Invalid port in target '{target}': {source}")]
    InvalidPort {
        target: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("No executor available for {kind} probes.")]
    UnsupportedType { kind: ProbeType },
    #[error("No external tool configured for {kind}.")]
    ToolNotConfigured { kind: String },
    #[error("Failed to launch '{program}': {source}")]
    ToolLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}: {stderr}")]
    ToolExit {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Tool output was not valid UTF-8: {source}")]
    ToolOutput {
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("A speed test is already running.")]
    SpeedtestBusy,
    #[error("Host facts collection did not finish: {source}")]
    HostFacts {
        #[source]
        source: tokio::task::JoinError,
    },
    #[error("Failed to discover local address: {source}")]
    LocalAddress {
        #[source]
        source: std::io::Error,
    },
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

pub type ProbeResult<T> = Result<T, ProbeError>;
