//! Health and metrics
//!
//! Append-only counters with read-time derived rates, and a read-only health
//! view over the aggregator, cache, and broadcast registry.

mod metrics;
mod monitor;

pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use monitor::{HealthMonitor, HealthReport};
