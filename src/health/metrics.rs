//! Relay counters and derived rates

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding window over which updates/second is derived
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Append-only relay counters
///
/// Rates are never stored; they are recomputed from the timestamp window at
/// read time so they cannot drift. `reset` zeroes the counters only.
pub struct RelayMetrics {
    updates_total: AtomicU64,
    protocol_errors_total: AtomicU64,
    connection_errors_total: AtomicU64,
    reconnects_total: AtomicU64,
    update_window: Mutex<VecDeque<Instant>>,
}

/// Point-in-time view of the counters, plus derived rates
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub updates_total: u64,
    pub protocol_errors_total: u64,
    pub connection_errors_total: u64,
    pub reconnects_total: u64,
    pub updates_per_second: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            updates_total: AtomicU64::new(0),
            protocol_errors_total: AtomicU64::new(0),
            connection_errors_total: AtomicU64::new(0),
            reconnects_total: AtomicU64::new(0),
            update_window: Mutex::new(VecDeque::new()),
        }
    }

    /// One quote received from the active feed
    pub fn record_update(&self) {
        self.updates_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("price_relay_updates_total").increment(1);

        let now = Instant::now();
        let mut window = self.update_window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(now);
        Self::prune(&mut window, now);
    }

    /// One malformed message skipped
    pub fn record_protocol_error(&self) {
        self.protocol_errors_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("price_relay_errors_total", "category" => "protocol").increment(1);
    }

    /// One feed connection lost or failed to establish
    pub fn record_connection_error(&self) {
        self.connection_errors_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("price_relay_errors_total", "category" => "connection").increment(1);
    }

    /// One reconnect attempt scheduled
    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("price_relay_reconnects_total").increment(1);
    }

    /// Updates/second over the sliding window, computed at read time
    pub fn updates_per_second(&self) -> f64 {
        let now = Instant::now();
        let mut window = self.update_window.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut window, now);
        window.len() as f64 / RATE_WINDOW.as_secs_f64()
    }

    /// Snapshot the counters, merging the cache's hit/miss stats
    pub fn snapshot(&self, cache_stats: crate::cache::CacheStats) -> MetricsSnapshot {
        MetricsSnapshot {
            updates_total: self.updates_total.load(Ordering::Relaxed),
            protocol_errors_total: self.protocol_errors_total.load(Ordering::Relaxed),
            connection_errors_total: self.connection_errors_total.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            updates_per_second: self.updates_per_second(),
            cache_hits: cache_stats.hits,
            cache_misses: cache_stats.misses,
            cache_hit_ratio: cache_stats.hit_ratio(),
        }
    }

    /// Administrative reset: zeroes counters, leaves everything else alone
    pub fn reset(&self) {
        self.updates_total.store(0, Ordering::Relaxed);
        self.protocol_errors_total.store(0, Ordering::Relaxed);
        self.connection_errors_total.store(0, Ordering::Relaxed);
        self.reconnects_total.store(0, Ordering::Relaxed);
        self.update_window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = window.front() {
            if now.duration_since(front) > RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
