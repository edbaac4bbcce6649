//! Result delivery. Probe workers hand [`crate::probe::ProbeData`] records to a
//! [`ResultSender`]; a single forwarder drains them into a [`ResultSink`].
mod channel;
mod writers;


pub use channel::{ResultReceiver, ResultSender, forward_results, result_channel};
pub use writers::{JsonLinesSink, MemorySink, ResultSink};
