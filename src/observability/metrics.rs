//! Atomic engine metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Thread-safe monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram for latencies in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    bucket_bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_scaled: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bucket_bounds,
            buckets,
            sum_scaled: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets suited to generation latency: tens of milliseconds up to a
    /// minute.
    pub fn default_latency() -> Self {
        Self::new(vec![
            50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0, 30000.0, 60000.0,
        ])
    }

    pub fn observe(&self, value_ms: f64) {
        let index = self
            .bucket_bounds
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(self.bucket_bounds.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        // Scaled by 1000 to keep sub-millisecond precision in the integer.
        self.sum_scaled
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum_scaled.load(Ordering::Relaxed) as f64 / 1000.0 / count as f64
    }
}

/// Engine-wide metrics registry.
#[derive(Debug)]
pub struct EngineMetrics {
    pub jobs_published: Counter,
    pub jobs_failed: Counter,
    pub jobs_deferred: Counter,
    pub llm_calls: Counter,
    pub llm_tokens: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub workers_busy: Gauge,
    pub workers_total: Gauge,
    pub job_latency: Histogram,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            jobs_published: Counter::new(),
            jobs_failed: Counter::new(),
            jobs_deferred: Counter::new(),
            llm_calls: Counter::new(),
            llm_tokens: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            workers_busy: Gauge::new(),
            workers_total: Gauge::new(),
            job_latency: Histogram::default_latency(),
        }
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> MetricsSummary {
        let busy = self.workers_busy.get().max(0) as f64;
        let total = self.workers_total.get().max(0) as f64;
        MetricsSummary {
            jobs_published: self.jobs_published.get(),
            jobs_failed: self.jobs_failed.get(),
            jobs_deferred: self.jobs_deferred.get(),
            llm_calls: self.llm_calls.get(),
            llm_tokens: self.llm_tokens.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            worker_utilization: if total > 0.0 { busy / total } else { 0.0 },
            mean_job_latency_ms: self.job_latency.mean_ms(),
        }
    }
}

/// Point-in-time metric values for the health surface.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub jobs_published: u64,
    pub jobs_failed: u64,
    pub jobs_deferred: u64,
    pub llm_calls: u64,
    pub llm_tokens: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub worker_utilization: f64,
    pub mean_job_latency_ms: f64,
}
