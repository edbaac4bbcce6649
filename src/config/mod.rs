//! Configuration loading and application.
pub(crate) mod apply;
mod loader;
mod parse;
pub mod types;

#[cfg(test)]
mod tests;

pub use apply::{apply_config, orchestrator_config, tool_commands, trafficsim_settings};
pub use loader::load_config;

pub(crate) use loader::DEFAULT_CONFIG_FILES;
pub(crate) use parse::parse_duration_value;
