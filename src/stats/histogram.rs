use hdrhistogram::Histogram;

/// HDR histogram of RTT samples in microseconds.
#[derive(Debug)]
pub struct RttHistogram {
    hist: Histogram<u64>,
}

impl RttHistogram {
    /// Create an empty histogram.
    ///
    /// # Errors
    ///
    /// Returns an error if the histogram cannot be created.
    pub fn new() -> Result<Self, String> {
        let hist = Histogram::<u64>::new(3)
            .map_err(|err| format!("Failed to create histogram: {}", err))?;
        Ok(Self { hist })
    }

    /// Record one RTT sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be recorded.
    pub fn record(&mut self, rtt_us: u64) -> Result<(), String> {
        let value = rtt_us.max(1);
        self.hist
            .record(value)
            .map_err(|err| format!("Failed to record rtt: {}", err))
    }

    /// p50, p90, p99 in microseconds; zeros when empty.
    #[must_use]
    pub fn percentiles(&self) -> (u64, u64, u64) {
        if self.count() == 0 {
            return (0, 0, 0);
        }

        (
            self.hist.value_at_quantile(0.5),
            self.hist.value_at_quantile(0.9),
            self.hist.value_at_quantile(0.99),
        )
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.hist.len()
    }
}
