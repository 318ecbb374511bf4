use tokio::time::Instant;

/// Monotonic millisecond clock, anchored at transport creation.
///
/// All protocol timing (RTT samples, retransmission deadlines, gap ages) is
/// derived from this clock; the 32-bit wire timestamp is a truncation of it.
/// Built on `tokio::time::Instant` so tests with a paused runtime control it.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// The sender timestamp for the wire header, truncated mod 2^32.
    pub fn wire_ts(&self) -> u32 {
        self.now_ms() as u32
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
