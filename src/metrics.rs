// metrics.rs

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::protocol::Action;

const LATENCY_WINDOW: usize = 100;

#[derive(Debug)]
pub struct EngineMetrics {
    // Request metrics
    requests_total: AtomicU64,
    failed_requests: AtomicU64,
    latencies: RwLock<VecDeque<f64>>,

    // Scheduling metrics
    skipped_point_cycles: AtomicU64,
    skipped_alarm_cycles: AtomicU64,
    skipped_interval_requests: AtomicU64,
    ignored_deliveries: AtomicU64,

    start_time: Instant,
    last_error: RwLock<Option<(Action, String)>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub skipped_point_cycles: u64,
    pub skipped_alarm_cycles: u64,
    pub skipped_interval_requests: u64,
    /// Response slots that reached no live handle.
    pub ignored_deliveries: u64,
    pub last_error: Option<String>,
    pub uptime: Duration,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            latencies: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            skipped_point_cycles: AtomicU64::new(0),
            skipped_alarm_cycles: AtomicU64::new(0),
            skipped_interval_requests: AtomicU64::new(0),
            ignored_deliveries: AtomicU64::new(0),
            start_time: Instant::now(),
            last_error: RwLock::new(None),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, action: Action, message: String) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some((action, message));
    }

    pub fn record_latency(&self, duration: Duration) {
        let mut latencies = self.latencies.write();
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_skipped_point_cycle(&self) {
        self.skipped_point_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_alarm_cycle(&self) {
        self.skipped_alarm_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_interval_request(&self) {
        self.skipped_interval_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored_delivery(&self) {
        self.ignored_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let failed_requests = self.failed_requests.load(Ordering::Relaxed);
        let error_rate = if requests_total > 0 {
            failed_requests as f64 / requests_total as f64
        } else {
            0.0
        };

        let average_latency_ms = {
            let latencies = self.latencies.read();
            if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            }
        };

        MetricsSnapshot {
            requests_total,
            failed_requests,
            error_rate,
            average_latency_ms,
            skipped_point_cycles: self.skipped_point_cycles.load(Ordering::Relaxed),
            skipped_alarm_cycles: self.skipped_alarm_cycles.load(Ordering::Relaxed),
            skipped_interval_requests: self.skipped_interval_requests.load(Ordering::Relaxed),
            ignored_deliveries: self.ignored_deliveries.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .read()
                .as_ref()
                .map(|(action, message)| format!("{}: {}", action, message)),
            uptime: self.start_time.elapsed(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate() {
        let metrics = EngineMetrics::new();
        for _ in 0..4 {
            metrics.record_request();
        }
        metrics.record_error(Action::Points, "timed out".to_string());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 4);
        assert_eq!(snapshot.error_rate, 0.25);
        assert_eq!(snapshot.last_error.as_deref(), Some("points: timed out"));
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = EngineMetrics::new();
        metrics.record_latency(Duration::from_millis(1000));
        for _ in 0..LATENCY_WINDOW {
            metrics.record_latency(Duration::from_millis(10));
        }
        assert!((metrics.snapshot().average_latency_ms - 10.0).abs() < 1e-9);
    }
}
