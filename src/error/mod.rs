mod app;
mod config;
mod probe;
mod sink;
mod trafficsim;
mod validation;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use config::ConfigError;
pub use probe::{ProbeError, ProbeResult};
pub use sink::SinkError;
pub use trafficsim::TrafficSimError;
pub use validation::ValidationError;
