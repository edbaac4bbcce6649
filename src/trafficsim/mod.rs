//! TrafficSim: UDP HELLO/ACK/DATA probing between two agents. Clients send
//! numbered DATA packets each cycle and report loss and RTT; listeners echo
//! them back for allow-listed peers.
mod client;
mod listeners;
mod local_addr;
mod protocol;
mod report;
mod server;
mod settings;
mod state;
mod trigger;


pub use client::ClientSession;
pub use listeners::{AllowList, ListenerRegistry};
pub use local_addr::discover_local_ip;
pub use protocol::{MAX_DATAGRAM, MessageKind, WireData, WireMessage, wall_clock_ms};
pub use report::TrafficSimReport;
pub use settings::TrafficSimSettings;
pub use state::SessionPhase;
pub use trigger::TraceTrigger;
