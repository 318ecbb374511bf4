use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Shared transport counters, updated from the hot paths with relaxed atomics
///  and readable at any time through [`TransportStats::snapshot`].
#[derive(Default)]
pub struct TransportStats {
    pub tx_total: AtomicU64,
    pub tx_reliable: AtomicU64,
    pub tx_unreliable: AtomicU64,
    pub rx_total: AtomicU64,
    pub rx_reliable: AtomicU64,
    pub rx_unreliable: AtomicU64,
    pub retx_count: AtomicU64,
    pub skip_count: AtomicU64,
    pub drop_count: AtomicU64,

    rtt: Mutex<RttEstimator>,
}

impl TransportStats {
    pub fn record_rtt(&self, rtt_ms: u64) {
        self.rtt.lock().unwrap().record(rtt_ms);
    }

    /// Best-effort current RTT estimate, `None` before the first sample.
    pub fn rtt_mean_ms(&self) -> Option<u64> {
        self.rtt.lock().unwrap().mean_ms()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_total: self.tx_total.load(Ordering::Relaxed),
            tx_reliable: self.tx_reliable.load(Ordering::Relaxed),
            tx_unreliable: self.tx_unreliable.load(Ordering::Relaxed),
            rx_total: self.rx_total.load(Ordering::Relaxed),
            rx_reliable: self.rx_reliable.load(Ordering::Relaxed),
            rx_unreliable: self.rx_unreliable.load(Ordering::Relaxed),
            retx_count: self.retx_count.load(Ordering::Relaxed),
            skip_count: self.skip_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            rtt_mean_ms: self.rtt_mean_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_total: u64,
    pub tx_reliable: u64,
    pub tx_unreliable: u64,
    pub rx_total: u64,
    pub rx_reliable: u64,
    pub rx_unreliable: u64,
    pub retx_count: u64,
    pub skip_count: u64,
    pub drop_count: u64,
    pub rtt_mean_ms: Option<u64>,
}

/// Windowed mean over the most recent samples.
#[derive(Default)]
struct RttEstimator {
    samples: VecDeque<u64>,
}

impl RttEstimator {
    const WINDOW: usize = 100;

    fn record(&mut self, rtt_ms: u64) {
        if self.samples.len() == Self::WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    fn mean_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }
}
