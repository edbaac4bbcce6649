use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrafficSimError {
    #[error("Failed to resolve '{target}': {source}")]
    Resolve {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Target '{target}' resolved to no addresses.")]
    NoAddress { target: String },
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("No ACK for HELLO from {target} within {timeout_ms}ms.")]
    HelloTimeout { target: String, timeout_ms: u64 },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Malformed datagram: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
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
