//! # Percentile Latency Tracking
//!
//! Tracks a rolling window of per-operation latencies and reports
//! min/p50/p95/p99/max/avg, the same shape `INFO`'s latency section and the
//! slow-log collaborator consume. Distinct from `hkv-server::metrics`'s
//! bucketed histogram: that one is cheap, lock-light, and meant for
//! high-frequency Prometheus-style scraping; this one keeps exact samples
//! (bounded to a window) so percentiles are exact, not bucket-approximated.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Number of most-recent samples kept per operation.
const WINDOW_SIZE: usize = 1000;

/// The operations this collector tracks, matching the engine's command
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Set,
    Get,
    Delete,
    Exists,
    Expire,
    Ttl,
    Keys,
    Dbsize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "set",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
            Operation::Expire => "expire",
            Operation::Ttl => "ttl",
            Operation::Keys => "keys",
            Operation::Dbsize => "dbsize",
        }
    }

    const ALL: [Operation; 8] = [
        Operation::Set,
        Operation::Get,
        Operation::Delete,
        Operation::Exists,
        Operation::Expire,
        Operation::Ttl,
        Operation::Keys,
        Operation::Dbsize,
    ];
}

/// Percentile summary for one operation's latency samples, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationStats {
    pub count: usize,
    pub min_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
    pub avg_us: f64,
}

struct Window {
    samples: VecDeque<f64>,
}

impl Window {
    fn new() -> Self {
        Window {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    fn push(&mut self, latency_us: f64) {
        if self.samples.len() == WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_us);
    }

    fn stats(&self) -> Option<OperationStats> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();

        Some(OperationStats {
            count,
            min_us: sorted[0],
            p50_us: sorted[count / 2],
            p95_us: sorted[((count as f64 * 0.95) as usize).min(count - 1)],
            p99_us: sorted[((count as f64 * 0.99) as usize).min(count - 1)],
            max_us: sorted[count - 1],
            avg_us: sum / count as f64,
        })
    }
}

/// Thread-safe rolling-window latency collector, one window per operation.
pub struct LatencyCollector {
    windows: [Mutex<Window>; 8],
}

impl LatencyCollector {
    pub fn new() -> Self {
        LatencyCollector {
            windows: std::array::from_fn(|_| Mutex::new(Window::new())),
        }
    }

    /// Records one sample for `operation`.
    pub fn record(&self, operation: Operation, latency_us: f64) {
        let idx = Operation::ALL
            .iter()
            .position(|op| *op == operation)
            .expect("Operation::ALL is exhaustive");
        self.windows[idx].lock().push(latency_us);
    }

    /// Returns percentile stats for every operation that has at least one
    /// recorded sample.
    pub fn stats(&self) -> Vec<(Operation, OperationStats)> {
        Operation::ALL
            .iter()
            .enumerate()
            .filter_map(|(idx, op)| self.windows[idx].lock().stats().map(|s| (*op, s)))
            .collect()
    }
}

impl Default for LatencyCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Window {
    fn default() -> Self {
        Window::new()
    }
}
