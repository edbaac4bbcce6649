//! CLI argument types and parsing helpers.
mod cli;
pub(crate) mod parsers;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use cli::AgentArgs;
pub use types::PositiveU64;
