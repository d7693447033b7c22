//! Metrics and tracing setup.
//!
//! Metrics are plain atomics sampled by the health surface; exporters live
//! outside the core. Tracing is structured via the `tracing` crate; the
//! subscriber here is a convenience for binaries and tests.

mod metrics;

pub use metrics::{Counter, EngineMetrics, Gauge, Histogram, MetricsSummary};

use tracing_subscriber::EnvFilter;

/// Install a formatted tracing subscriber honouring `RUST_LOG`. Safe to
/// call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
