//! Concurrency-safe last-price cache
//!
//! Single writer (the aggregator task), many concurrent readers (broadcast
//! tick, accessor calls). Writes are a pure overwrite keyed by symbol, guarded
//! by the monotonic-timestamp rule: a quote that is not strictly newer than
//! the cached observation is dropped, which makes re-delivery idempotent and
//! prevents flicker back to a superseded source after failover.

use crate::feed::PriceQuote;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// One cached observation
#[derive(Debug, Clone)]
struct CacheEntry {
    quote: PriceQuote,
    cached_at: DateTime<Utc>,
}

/// A cache read result, with staleness resolved at read time
#[derive(Debug, Clone)]
pub struct CachedQuote {
    pub quote: PriceQuote,
    pub cached_at: DateTime<Utc>,
    /// True once the entry's age exceeds the TTL; stale entries are still
    /// served, callers decide what to do with them
    pub stale: bool,
}

/// Hit/miss counts for single-symbol lookups
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit ratio in [0, 1]; 1.0 when no lookups have happened
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Symbol -> latest quote store with TTL-based staleness tracking
pub struct PriceCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: chrono::Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Apply a quote. Returns false when the write was rejected because the
    /// cached observation is already as new or newer.
    pub fn set(&self, quote: PriceQuote) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = entries.get(&quote.symbol) {
            if quote.observed_at <= existing.quote.observed_at {
                tracing::debug!(
                    symbol = %quote.symbol,
                    incoming = %quote.observed_at,
                    cached = %existing.quote.observed_at,
                    "Dropping out-of-date quote"
                );
                return false;
            }
        }

        entries.insert(
            quote.symbol.clone(),
            CacheEntry {
                quote,
                cached_at: Utc::now(),
            },
        );
        true
    }

    /// Look up one symbol
    pub fn get(&self, symbol: &str) -> Option<CachedQuote> {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        match entries.get(symbol) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(self.resolve(entry, now))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Snapshot every cached symbol under a single read guard
    pub fn get_all(&self) -> HashMap<String, CachedQuote> {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        entries
            .iter()
            .map(|(symbol, entry)| (symbol.clone(), self.resolve(entry, now)))
            .collect()
    }

    /// Bulk lookup; absent symbols are simply missing from the result
    pub fn get_many(&self, symbols: &[String]) -> HashMap<String, CachedQuote> {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        let mut out = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            match entries.get(symbol) {
                Some(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    out.insert(symbol.clone(), self.resolve(entry, now));
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        out
    }

    /// Number of cached symbols
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the newest cached observation, if any
    pub fn newest_cached_at(&self) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().map(|e| e.cached_at).max()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn resolve(&self, entry: &CacheEntry, now: DateTime<Utc>) -> CachedQuote {
        CachedQuote {
            quote: entry.quote.clone(),
            cached_at: entry.cached_at,
            stale: now - entry.cached_at > self.ttl,
        }
    }
}
