//! In-process metrics registry.
//!
//! Counters and gauges are plain atomics so every pipeline stage can record
//! without contention; the snapshot feeds the health endpoints and logs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Latency histogram over fixed millisecond buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    /// Bucket upper bounds in milliseconds.
    const BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub const fn new() -> Self {
        Self {
            buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (i, &bound) in Self::BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

/// Global registry of pipeline metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    // Intake
    pub frames_received: Counter,
    pub frames_dropped: Counter,
    pub decode_errors: Counter,
    pub decode_property_skipped: Counter,
    pub alias_misses: Counter,
    pub rebirth_requests: Counter,

    // Persistence
    pub frames_persisted: Counter,
    pub frames_skipped: Counter,
    pub db_retries: Counter,
    pub constraint_violations: Counter,
    pub lineage_rows: Counter,

    // CDC
    pub cdc_records: Counter,
    pub cdc_events: Counter,
    pub cdc_payloads: Counter,
    pub cdc_errors: Counter,
    pub cdc_reconnects: Counter,
    pub debounce_dropped: Counter,
    pub debounce_emitted: Counter,
    pub debounce_depth: Gauge,

    // Egress
    pub egress_requests: Counter,
    pub egress_success: Counter,
    pub egress_retries: Counter,
    pub egress_failures: Counter,
    pub egress_throttled: Counter,
    pub egress_queue_depth: Gauge,
    pub egress_queue_dropped: Counter,
    pub egress_latency_ms: Histogram,

    // Failure handling
    pub circuit_opens: Counter,
    pub circuit_state: Gauge,
    pub dead_letters: Counter,
    pub dlq_depth: Gauge,
}

/// Point-in-time numeric view of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub frames_persisted: u64,
    pub cdc_records: u64,
    pub cdc_payloads: u64,
    pub debounce_depth: u64,
    pub egress_requests: u64,
    pub egress_success: u64,
    pub egress_retries: u64,
    pub egress_failures: u64,
    pub dead_letters: u64,
    pub dlq_depth: u64,
    pub egress_latency_mean_ms: f64,
}

impl MetricsRegistry {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.get(),
            frames_dropped: self.frames_dropped.get(),
            decode_errors: self.decode_errors.get(),
            frames_persisted: self.frames_persisted.get(),
            cdc_records: self.cdc_records.get(),
            cdc_payloads: self.cdc_payloads.get(),
            debounce_depth: self.debounce_depth.get(),
            egress_requests: self.egress_requests.get(),
            egress_success: self.egress_success.get(),
            egress_retries: self.egress_retries.get(),
            egress_failures: self.egress_failures.get(),
            dead_letters: self.dead_letters.get(),
            dlq_depth: self.dlq_depth.get(),
            egress_latency_mean_ms: self.egress_latency_ms.mean(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<MetricsRegistry> =
    std::sync::LazyLock::new(MetricsRegistry::default);

/// Get the global metrics registry.
pub fn metrics() -> &'static MetricsRegistry {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge_basics() {
        let counter = Counter::new();
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.set(3);
        gauge.dec();
        gauge.dec();
        gauge.dec();
        gauge.dec(); // saturates at zero
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn histogram_tracks_mean() {
        let hist = Histogram::new();
        hist.observe(10);
        hist.observe(20);
        assert_eq!(hist.count(), 2);
        assert!((hist.mean() - 15.0).abs() < f64::EPSILON);
    }
}
