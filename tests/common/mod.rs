//! Shared test fixtures: scripted feeds and config helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use price_relay::config::Config;
use price_relay::feed::{
    FeedError, FeedEvent, FeedSubscription, PriceFeed, PriceQuote, QuoteSource,
};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// One subscribe() outcome
pub enum Script {
    /// Refuse the subscription
    Refuse,
    /// Accept, emit these events, then hold the channel open until closed
    Emit(Vec<FeedEvent>),
}

/// Feed whose successive subscriptions follow a script
pub struct ScriptedFeed {
    source: QuoteSource,
    scripts: Mutex<Vec<Script>>,
}

impl ScriptedFeed {
    pub fn new(source: QuoteSource, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            source,
            scripts: Mutex::new(scripts),
        })
    }
}

#[async_trait]
impl PriceFeed for ScriptedFeed {
    fn source(&self) -> QuoteSource {
        self.source
    }

    async fn subscribe(&self) -> Result<FeedSubscription, FeedError> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Script::Refuse
            } else {
                scripts.remove(0)
            }
        };

        match script {
            Script::Refuse => Err(FeedError::Subscribe("refused".into())),
            Script::Emit(events) => {
                let (tx, rx) = mpsc::channel(64);
                let (close_tx, mut close_rx) = oneshot::channel();
                tokio::spawn(async move {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    let _ = (&mut close_rx).await;
                });
                Ok(FeedSubscription::new(rx, close_tx))
            }
        }
    }
}

pub fn quote(symbol: &str, price: Decimal, observed_ms: i64, source: QuoteSource) -> PriceQuote {
    PriceQuote {
        symbol: symbol.to_string(),
        price,
        observed_at: Utc.timestamp_millis_opt(observed_ms).single().unwrap(),
        source,
    }
}

/// Fast-moving config bound to an ephemeral port
pub fn test_config(ttl_secs: u64, silence_secs: u64) -> Config {
    toml::from_str(&format!(
        r#"
        [feed]
        primary_url = "ws://127.0.0.1:1"
        secondary_url = "ws://127.0.0.1:1"
        symbols = ["BTCUSDT"]

        [cache]
        ttl_secs = {ttl_secs}

        [aggregator]
        silence_window_secs = {silence_secs}
        backoff_base_ms = 10
        backoff_cap_ms = 50

        [broadcast]
        bind_addr = "127.0.0.1:0"
        tick_interval_ms = 50
        keepalive_interval_secs = 20
        keepalive_grace_secs = 20
        write_timeout_ms = 50
        max_slow_writes = 3

        [telemetry]
        metrics_port = 0
        log_level = "warn"
    "#
    ))
    .unwrap()
}
