// Metrics Collector
// Rolling counters and duration samples for checks and downloads

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples kept per duration buffer
pub const DURATION_CAPACITY: usize = 100;

/// Window (in checks) the cache hit rate is computed over
pub const HIT_RATE_WINDOW: usize = 1000;

/// Point-in-time copy of the collected metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub check_count: u64,
    pub check_durations: Vec<u64>,
    pub download_count: u64,
    pub download_durations: Vec<u64>,
    pub error_count: u64,
    pub cache_hit_count: u64,
    /// Percentage (0.0 - 100.0) of recent checks answered from cache
    pub cache_hit_rate: f64,
    pub retry_count: u64,
    pub timeout_count: u64,
    pub average_check_ms: Option<f64>,
    pub average_download_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct Counters {
    check_count: u64,
    /// Last `HIT_RATE_WINDOW` check outcomes, `true` for a cache hit
    recent_outcomes: VecDeque<bool>,
    cache_hits: u64,
    check_durations: VecDeque<u64>,
    download_count: u64,
    download_durations: VecDeque<u64>,
    error_count: u64,
    retry_count: u64,
    timeout_count: u64,
}

fn push_bounded(buffer: &mut VecDeque<u64>, value: u64) {
    if buffer.len() == DURATION_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

fn average(buffer: &VecDeque<u64>) -> Option<f64> {
    if buffer.is_empty() {
        return None;
    }
    Some(buffer.iter().sum::<u64>() as f64 / buffer.len() as f64)
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Mutex<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache hits count towards `check_count` but record no duration
    pub fn record_check(&self, duration_ms: u64, cache_hit: bool) {
        let mut counters = self.counters.lock();
        counters.check_count += 1;
        if counters.recent_outcomes.len() == HIT_RATE_WINDOW {
            counters.recent_outcomes.pop_front();
        }
        counters.recent_outcomes.push_back(cache_hit);
        if cache_hit {
            counters.cache_hits += 1;
        } else {
            push_bounded(&mut counters.check_durations, duration_ms);
        }
    }

    pub fn record_download(&self, duration_ms: u64) {
        let mut counters = self.counters.lock();
        counters.download_count += 1;
        push_bounded(&mut counters.download_durations, duration_ms);
    }

    pub fn record_retry(&self) {
        self.counters.lock().retry_count += 1;
    }

    pub fn record_timeout(&self) {
        self.counters.lock().timeout_count += 1;
    }

    pub fn record_error(&self) {
        self.counters.lock().error_count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock();

        let window = counters.recent_outcomes.len();
        let cache_hit_rate = if window == 0 {
            0.0
        } else {
            let hits = counters.recent_outcomes.iter().filter(|hit| **hit).count();
            hits as f64 / window as f64 * 100.0
        };

        MetricsSnapshot {
            check_count: counters.check_count,
            check_durations: counters.check_durations.iter().copied().collect(),
            download_count: counters.download_count,
            download_durations: counters.download_durations.iter().copied().collect(),
            error_count: counters.error_count,
            cache_hit_count: counters.cache_hits,
            cache_hit_rate,
            retry_count: counters.retry_count,
            timeout_count: counters.timeout_count,
            average_check_ms: average(&counters.check_durations),
            average_download_ms: average(&counters.download_durations),
        }
    }

    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }
}
