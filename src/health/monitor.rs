//! Read-only health aggregation

use super::metrics::{MetricsSnapshot, RelayMetrics};
use crate::aggregator::FeedState;
use crate::broadcast::BroadcastManager;
use crate::cache::PriceCache;
use crate::feed::QuoteSource;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Point-in-time health view
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: FeedState,
    pub source: Option<QuoteSource>,
    pub cached_symbols: usize,
    pub subscribers: usize,
    /// Milliseconds since the quietest subscriber last showed keep-alive
    /// activity, if any are connected
    pub max_subscriber_idle_ms: Option<u64>,
}

/// Read-only view over the aggregator, cache, and broadcast registry
pub struct HealthMonitor {
    cache: Arc<PriceCache>,
    metrics: Arc<RelayMetrics>,
    broadcast: Arc<BroadcastManager>,
    state_rx: watch::Receiver<FeedState>,
    staleness_window: chrono::Duration,
}

impl HealthMonitor {
    pub fn new(
        cache: Arc<PriceCache>,
        metrics: Arc<RelayMetrics>,
        broadcast: Arc<BroadcastManager>,
        state_rx: watch::Receiver<FeedState>,
        staleness_window: Duration,
    ) -> Self {
        Self {
            cache,
            metrics,
            broadcast,
            state_rx,
            staleness_window: chrono::Duration::from_std(staleness_window)
                .unwrap_or(chrono::Duration::seconds(30)),
        }
    }

    /// Healthy means: connected to a source AND at least one quote landed
    /// within the staleness window.
    pub fn report(&self) -> HealthReport {
        let state = *self.state_rx.borrow();
        let fresh = self
            .cache
            .newest_cached_at()
            .map(|at| Utc::now() - at <= self.staleness_window)
            .unwrap_or(false);

        HealthReport {
            healthy: state.is_connected() && fresh,
            state,
            source: state.active_source(),
            cached_symbols: self.cache.len(),
            subscribers: self.broadcast.connection_count(),
            max_subscriber_idle_ms: self
                .broadcast
                .max_idle()
                .map(|d| d.as_millis() as u64),
        }
    }

    /// Counters and derived rates
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.cache.stats())
    }

    /// Administrative counter reset; feed state and cache contents untouched
    pub fn reset_metrics(&self) {
        tracing::info!("Resetting relay metrics");
        self.metrics.reset();
        self.cache.reset_stats();
    }
}
