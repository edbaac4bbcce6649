use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::stats::{AckOutcome, PacketMap, PacketTiming};

/// Observable lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Sending,
    Waiting,
    Reporting,
    Closing,
    Stopped,
}

impl SessionPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Sending => "sending",
            Self::Waiting => "waiting",
            Self::Reporting => "reporting",
            Self::Closing => "closing",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic microsecond clock anchored at session start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub(crate) fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub(crate) fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// How the receive path disposed of an ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckDisposition {
    Applied(AckOutcome),
    /// No packet with this sequence in the current cycle.
    Unknown,
    /// Sequence matches but the echoed send time belongs to an older cycle.
    Stale,
}

/// Per-cycle packet bookkeeping shared by the send, receive and report tasks.
/// Callers hold the lock only for the duration of one method call.
#[derive(Debug, Default)]
pub(crate) struct CycleState {
    sequence: u32,
    cycle: u64,
    packets: PacketMap,
}

impl CycleState {
    /// Allocates the next sequence number (starting at 1) and records its send time.
    pub(crate) fn record_send(&mut self, sent_us: u64, sent_wall_ms: i64) -> u32 {
        self.sequence = self.sequence.saturating_add(1);
        self.packets
            .insert(self.sequence, PacketTiming::new(sent_us, sent_wall_ms));
        self.sequence
    }

    pub(crate) fn apply_ack(
        &mut self,
        seq: u32,
        echoed_sent_ms: i64,
        now_us: u64,
        loss_timeout: Duration,
    ) -> AckDisposition {
        let Some(timing) = self.packets.get_mut(&seq) else {
            return AckDisposition::Unknown;
        };
        if timing.sent_wall_ms != echoed_sent_ms {
            return AckDisposition::Stale;
        }
        timing.expire(now_us, loss_timeout);
        AckDisposition::Applied(timing.mark_received(now_us))
    }

    pub(crate) fn all_acknowledged(&self) -> bool {
        self.packets
            .values()
            .all(|timing| timing.received_us.is_some())
    }

    /// Expires overdue packets, hands the map to the caller and resets the
    /// sequence for the next cycle. Returns the finished cycle's index.
    pub(crate) fn finish_cycle(&mut self, now_us: u64, loss_timeout: Duration) -> (u64, PacketMap) {
        for timing in self.packets.values_mut() {
            timing.expire(now_us, loss_timeout);
        }
        let packets = std::mem::take(&mut self.packets);
        let cycle = self.cycle;
        self.cycle = self.cycle.saturating_add(1);
        self.sequence = 0;
        (cycle, packets)
    }

    #[cfg(test)]
    pub(crate) const fn packets(&self) -> &PacketMap {
        &self.packets
    }
}

pub(crate) fn lock_cycle(state: &Mutex<CycleState>) -> MutexGuard<'_, CycleState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
