//! Core library for the `netprobe` network-health agent.
//!
//! The agent receives a desired-state list of probes, reconciles it into
//! running measurement workers, and streams each worker's results to a
//! sink. The TrafficSim module implements the UDP round-trip protocol used
//! between agents to measure latency, jitter and loss; sustained loss
//! triggers an on-demand path trace toward the affected peer.
pub mod args;
pub mod config;
pub mod control;
pub mod entry;
pub mod error;
pub mod executors;
pub mod logger;
pub mod orchestrator;
pub mod probe;
pub mod shutdown;
pub mod shutdown_handlers;
pub mod sinks;
pub mod stats;
pub mod trafficsim;
