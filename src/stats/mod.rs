//! Round-trip statistics over one TrafficSim test cycle.
mod histogram;
mod window;


pub use histogram::RttHistogram;
pub use window::{
    AckOutcome, PacketMap, PacketTiming, WindowStats, compute, micros_to_millis_f64,
    x100_to_f64,
};
