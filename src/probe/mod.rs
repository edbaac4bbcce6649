//! Probe definitions delivered by the control plane and the result records
//! produced for them.
mod data;
mod target;
mod types;


pub use data::{ProbeData, ProbePayload};
pub use target::{SocketTarget, split_host_port, strip_port};
pub use types::{AgentId, Probe, ProbeConfig, ProbeId, ProbeTarget, ProbeType};
