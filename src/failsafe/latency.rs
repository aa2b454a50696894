//! Call latency tracking
//!
//! Keeps a bounded window of recent call latencies and reports
//! p50/p95/p99 for adapter metrics.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Default capacity for the latency window
const DEFAULT_WINDOW: usize = 1000;

/// Thread-safe latency tracker
pub struct LatencyTracker {
    histogram: RwLock<LatencyHistogram>,
}

impl LatencyTracker {
    /// Create a tracker with the default window
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    /// Create a tracker keeping at most `capacity` samples
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            histogram: RwLock::new(LatencyHistogram::new(capacity)),
        }
    }

    /// Record one call latency
    pub fn record(&self, latency: Duration) {
        self.histogram.write().record(latency);
    }

    /// Percentile snapshot
    pub fn stats(&self) -> LatencyStats {
        let histogram = self.histogram.read();
        let sorted = histogram.sorted();
        LatencyStats {
            samples: sorted.len(),
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency percentiles in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    /// Samples in the window
    pub samples: usize,
    /// 50th percentile
    pub p50_ms: Option<u64>,
    /// 95th percentile
    pub p95_ms: Option<u64>,
    /// 99th percentile
    pub p99_ms: Option<u64>,
}

struct LatencyHistogram {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(DEFAULT_WINDOW)),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    fn sorted(&self) -> Vec<u64> {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}
