use super::{ConfigError, ProbeError, SinkError, TrafficSimError, ValidationError};

impl From<&'static str> for ValidationError {
    fn from(message: &'static str) -> Self {
        ValidationError::TestExpectation { message }
    }
}

impl From<String> for ValidationError {
    fn from(value: String) -> Self {
        ValidationError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ProbeError {
    fn from(message: &'static str) -> Self {
        ProbeError::TestExpectation { message }
    }
}

impl From<String> for ProbeError {
    fn from(value: String) -> Self {
        ProbeError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for TrafficSimError {
    fn from(message: &'static str) -> Self {
        TrafficSimError::TestExpectation { message }
    }
}

impl From<String> for TrafficSimError {
    fn from(value: String) -> Self {
        TrafficSimError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for SinkError {
    fn from(message: &'static str) -> Self {
        SinkError::TestExpectation { message }
    }
}

impl From<String> for SinkError {
    fn from(value: String) -> Self {
        SinkError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
