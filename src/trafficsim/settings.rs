use std::time::Duration;

const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PACKETS_PER_CYCLE: u32 = 60;
const DEFAULT_LOSS_TIMEOUT: Duration = Duration::from_millis(1500);
const DEFAULT_MAX_EXTRA_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_LOSS_THRESHOLD_PCT: u64 = 5;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_LISTENER_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing knobs shared by TrafficSim clients and listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSimSettings {
    pub send_interval: Duration,
    pub packets_per_cycle: u32,
    /// An unacknowledged packet older than this is lost.
    pub loss_timeout: Duration,
    /// How long the report step waits for trailing ACKs after the last send.
    pub max_extra_wait: Duration,
    /// Loss above this percentage requests a triggered trace.
    pub loss_threshold_pct: u64,
    pub retry_delay: Duration,
    pub hello_timeout: Duration,
    pub read_timeout: Duration,
    /// Listener-side peers silent for this long are forgotten.
    pub idle_timeout: Duration,
    /// Bound on waiting for a listener task to exit before aborting it.
    pub teardown_timeout: Duration,
}

impl Default for TrafficSimSettings {
    fn default() -> Self {
        Self {
            send_interval: DEFAULT_SEND_INTERVAL,
            packets_per_cycle: DEFAULT_PACKETS_PER_CYCLE,
            loss_timeout: DEFAULT_LOSS_TIMEOUT,
            max_extra_wait: DEFAULT_MAX_EXTRA_WAIT,
            loss_threshold_pct: DEFAULT_LOSS_THRESHOLD_PCT,
            retry_delay: DEFAULT_RETRY_DELAY,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            teardown_timeout: DEFAULT_LISTENER_TEARDOWN_TIMEOUT,
        }
    }
}

impl TrafficSimSettings {
    #[must_use]
    pub const fn loss_threshold_x100(&self) -> u64 {
        self.loss_threshold_pct.saturating_mul(100)
    }
}
