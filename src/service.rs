//! The assembled relay: one constructed object with an explicit lifecycle
//!
//! Owns the cache, aggregator, broadcast manager, and health monitor, and
//! exposes the synchronous price accessor consumed by in-process callers
//! (portfolio valuation, order pricing, alerts).

use crate::aggregator::{AggregatorHandle, PriceAggregator};
use crate::broadcast::{BroadcastManager, BroadcastServer};
use crate::cache::PriceCache;
use crate::config::Config;
use crate::feed::{BinanceFeed, CoinbaseFeed, PriceFeed};
use crate::health::{HealthMonitor, HealthReport, MetricsSnapshot, RelayMetrics};
use anyhow::Context;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Accessor result for one symbol
#[derive(Debug, Clone, Serialize)]
pub struct PriceResult {
    pub price: Decimal,
    pub stale: bool,
}

struct Running {
    agg_handle: AggregatorHandle,
    server_shutdown: oneshot::Sender<()>,
    server_task: tokio::task::JoinHandle<()>,
    bound_addr: SocketAddr,
}

/// Real-time price relay service
pub struct PriceRelay {
    cache: Arc<PriceCache>,
    broadcast: Arc<BroadcastManager>,
    health: HealthMonitor,
    aggregator: Option<PriceAggregator>,
    running: Option<Running>,
}

impl PriceRelay {
    /// Build the relay with the production feed adapters
    pub fn new(config: &Config) -> Self {
        let primary: Arc<dyn PriceFeed> = Arc::new(BinanceFeed::new(
            &config.feed.primary_url,
            config.feed.symbols.clone(),
        ));
        let secondary: Arc<dyn PriceFeed> = Arc::new(CoinbaseFeed::new(
            &config.feed.secondary_url,
            config.feed.symbols.clone(),
        ));
        Self::with_feeds(config, primary, secondary)
    }

    /// Build the relay with injected feeds (tests use scripted ones)
    pub fn with_feeds(
        config: &Config,
        primary: Arc<dyn PriceFeed>,
        secondary: Arc<dyn PriceFeed>,
    ) -> Self {
        let cache = Arc::new(PriceCache::new(config.cache.ttl()));
        let metrics = Arc::new(RelayMetrics::new());

        let aggregator = PriceAggregator::new(
            config.aggregator.clone(),
            primary,
            secondary,
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );
        let state_rx = aggregator.state_receiver();

        let broadcast = Arc::new(BroadcastManager::new(
            config.broadcast.clone(),
            Arc::clone(&cache),
            state_rx.clone(),
        ));

        let health = HealthMonitor::new(
            Arc::clone(&cache),
            metrics,
            Arc::clone(&broadcast),
            state_rx,
            config.cache.ttl(),
        );

        Self {
            cache,
            broadcast,
            health,
            aggregator: Some(aggregator),
            running: None,
        }
    }

    /// Bind the subscription server and start the aggregator task
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let aggregator = self
            .aggregator
            .take()
            .context("relay already started")?;

        let server = BroadcastServer::bind(Arc::clone(&self.broadcast)).await?;
        let bound_addr = server.local_addr()?;

        let (server_shutdown, shutdown_rx) = oneshot::channel();
        let server_task = tokio::spawn(server.serve(shutdown_rx));
        let agg_handle = aggregator.start();

        self.running = Some(Running {
            agg_handle,
            server_shutdown,
            server_task,
            bound_addr,
        });
        tracing::info!(addr = %bound_addr, "Price relay started");
        Ok(())
    }

    /// The subscription server's bound address, once started
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.bound_addr)
    }

    /// Stop the aggregator and the subscription server
    pub async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.server_shutdown.send(());
            running.agg_handle.shutdown().await;
            if let Err(e) = running.server_task.await {
                tracing::warn!(error = %e, "Server task did not shut down cleanly");
            }
            tracing::info!("Price relay stopped");
        }
    }

    /// Last known price for one symbol; `None` when never observed
    pub fn get_price(&self, symbol: &str) -> Option<PriceResult> {
        self.cache.get(symbol).map(|cached| PriceResult {
            price: cached.quote.price,
            stale: cached.stale,
        })
    }

    /// Bulk lookup; absent symbols are missing from the result
    pub fn get_prices(&self, symbols: &[String]) -> HashMap<String, PriceResult> {
        self.cache
            .get_many(symbols)
            .into_iter()
            .map(|(symbol, cached)| {
                (
                    symbol,
                    PriceResult {
                        price: cached.quote.price,
                        stale: cached.stale,
                    },
                )
            })
            .collect()
    }

    /// Every cached symbol
    pub fn get_all_prices(&self) -> HashMap<String, PriceResult> {
        self.cache
            .get_all()
            .into_iter()
            .map(|(symbol, cached)| {
                (
                    symbol,
                    PriceResult {
                        price: cached.quote.price,
                        stale: cached.stale,
                    },
                )
            })
            .collect()
    }

    pub fn get_health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.health.metrics()
    }

    pub fn reset_metrics(&self) {
        self.health.reset_metrics();
    }
}
