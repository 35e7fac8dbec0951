//! Broadcast fan-out over downstream subscriptions
//!
//! Transport-agnostic: the manager hands each registered client a frame
//! channel; the WebSocket server (or a test) drains it. One shared tick task
//! reads a single cache snapshot per tick and writes the filtered view to
//! every client. The tick task starts lazily with the first client and exits
//! when the registry empties.

use super::protocol::{ServerMessage, SubscriptionFilter};
use crate::aggregator::FeedState;
use crate::cache::PriceCache;
use crate::config::BroadcastConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Frames buffered per client before writes start timing out
const CLIENT_CHANNEL_CAPACITY: usize = 8;

struct Client {
    filter: SubscriptionFilter,
    frames: mpsc::Sender<String>,
    slow_strikes: u32,
    last_activity: Instant,
}

struct Registry {
    clients: HashMap<Uuid, Client>,
    tick_running: bool,
}

/// Tracks subscriptions and runs the shared broadcast tick
pub struct BroadcastManager {
    cfg: BroadcastConfig,
    cache: Arc<PriceCache>,
    state_rx: watch::Receiver<FeedState>,
    inner: Arc<Mutex<Registry>>,
}

impl BroadcastManager {
    pub fn new(
        cfg: BroadcastConfig,
        cache: Arc<PriceCache>,
        state_rx: watch::Receiver<FeedState>,
    ) -> Self {
        Self {
            cfg,
            cache,
            state_rx,
            inner: Arc::new(Mutex::new(Registry {
                clients: HashMap::new(),
                tick_running: false,
            })),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.cfg
    }

    /// Register a connection. Returns its id and the frame stream to drain.
    /// An initial `status` frame is queued immediately.
    pub fn register(&self, filter: SubscriptionFilter) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);

        let status = ServerMessage::status(*self.state_rx.borrow(), self.cache.len()).to_json();
        let _ = tx.try_send(status);

        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        registry.clients.insert(
            id,
            Client {
                filter,
                frames: tx,
                slow_strikes: 0,
                last_activity: Instant::now(),
            },
        );
        let count = registry.clients.len();
        metrics::gauge!("price_relay_connections").set(count as f64);
        tracing::info!(connection = %id, connections = count, "Subscriber registered");

        if !registry.tick_running {
            registry.tick_running = true;
            tokio::spawn(Self::run_tick_loop(
                self.cfg.clone(),
                Arc::clone(&self.cache),
                self.state_rx.clone(),
                Arc::clone(&self.inner),
            ));
        }
        drop(registry);

        (id, rx)
    }

    /// Drop a connection (explicit close or transport error)
    pub fn remove(&self, id: &Uuid) {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if registry.clients.remove(id).is_some() {
            let count = registry.clients.len();
            metrics::gauge!("price_relay_connections").set(count as f64);
            tracing::info!(connection = %id, connections = count, "Subscriber removed");
        }
    }

    /// Record keep-alive activity (a pong) for a connection
    pub fn touch(&self, id: &Uuid) {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = registry.clients.get_mut(id) {
            client.last_activity = Instant::now();
        }
    }

    /// Number of live subscriptions
    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clients
            .len()
    }

    /// Longest time since any connection last showed keep-alive activity
    pub fn max_idle(&self) -> Option<Duration> {
        let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .clients
            .values()
            .map(|c| c.last_activity.elapsed())
            .max()
    }

    async fn run_tick_loop(
        cfg: BroadcastConfig,
        cache: Arc<PriceCache>,
        mut state_rx: watch::Receiver<FeedState>,
        inner: Arc<Mutex<Registry>>,
    ) {
        tracing::debug!("Broadcast tick started");
        let mut interval = tokio::time::interval(cfg.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut state_alive = true;

        loop {
            let state_changed = async {
                if state_alive {
                    state_rx.changed().await
                } else {
                    std::future::pending().await
                }
            };

            let frame = tokio::select! {
                _ = interval.tick() => {
                    let snapshot = cache.get_all();
                    let source = state_rx.borrow().active_source();
                    Tick::Prices { snapshot, source }
                }
                changed = state_changed => {
                    match changed {
                        Ok(()) => {
                            let state = *state_rx.borrow_and_update();
                            Tick::Status { state, cached: cache.len() }
                        }
                        Err(_) => {
                            // Aggregator gone; keep serving price ticks
                            state_alive = false;
                            continue;
                        }
                    }
                }
            };

            if Self::fan_out(&cfg, &inner, frame).await {
                tracing::debug!("Last subscriber gone, broadcast tick stopping");
                return;
            }
        }
    }

    /// Deliver one tick's output to every client. Returns true when the
    /// registry is empty and the tick task should exit.
    async fn fan_out(cfg: &BroadcastConfig, inner: &Arc<Mutex<Registry>>, tick: Tick) -> bool {
        let idle_cutoff = cfg.keepalive_interval() + cfg.keepalive_grace();

        // Render per-client frames under the lock, write outside it
        let outbox: Vec<(Uuid, mpsc::Sender<String>, String)> = {
            let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());

            let dead: Vec<Uuid> = registry
                .clients
                .iter()
                .filter(|(_, c)| c.last_activity.elapsed() > idle_cutoff)
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                tracing::warn!(connection = %id, "Pruning unresponsive subscriber");
                registry.clients.remove(&id);
            }

            if registry.clients.is_empty() {
                registry.tick_running = false;
                metrics::gauge!("price_relay_connections").set(0.0);
                return true;
            }

            registry
                .clients
                .iter()
                .filter_map(|(id, client)| {
                    let frame = match &tick {
                        Tick::Prices { snapshot, source } => {
                            let view = client.filter.apply(snapshot)?;
                            ServerMessage::price_update(&view, *source).to_json()
                        }
                        Tick::Status { state, cached } => {
                            ServerMessage::status(*state, *cached).to_json()
                        }
                    };
                    Some((*id, client.frames.clone(), frame))
                })
                .collect()
        };

        let mut slow: Vec<Uuid> = Vec::new();
        let mut ok: Vec<Uuid> = Vec::new();
        let mut closed: Vec<Uuid> = Vec::new();

        for (id, tx, frame) in outbox {
            match tx.send_timeout(frame, cfg.write_timeout()).await {
                Ok(()) => ok.push(id),
                Err(SendTimeoutError::Timeout(_)) => slow.push(id),
                Err(SendTimeoutError::Closed(_)) => closed.push(id),
            }
        }

        let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());
        for id in ok {
            if let Some(client) = registry.clients.get_mut(&id) {
                client.slow_strikes = 0;
            }
        }
        for id in closed {
            registry.clients.remove(&id);
        }
        for id in slow {
            if let Some(client) = registry.clients.get_mut(&id) {
                client.slow_strikes += 1;
                if client.slow_strikes >= cfg.max_slow_writes {
                    tracing::warn!(
                        connection = %id,
                        strikes = client.slow_strikes,
                        "Dropping slow subscriber"
                    );
                    registry.clients.remove(&id);
                    metrics::counter!("price_relay_slow_drops_total").increment(1);
                }
            }
        }

        let count = registry.clients.len();
        metrics::gauge!("price_relay_connections").set(count as f64);
        if count == 0 {
            registry.tick_running = false;
            return true;
        }
        false
    }
}

enum Tick {
    Prices {
        snapshot: HashMap<String, crate::cache::CachedQuote>,
        source: Option<crate::feed::QuoteSource>,
    },
    Status {
        state: FeedState,
        cached: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{PriceQuote, QuoteSource};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::time::timeout;

    fn cfg_fast() -> BroadcastConfig {
        BroadcastConfig {
            bind_addr: "127.0.0.1:0".into(),
            tick_interval_ms: 20,
            keepalive_interval_secs: 60,
            keepalive_grace_secs: 60,
            write_timeout_ms: 10,
            max_slow_writes: 2,
        }
    }

    fn setup(cfg: BroadcastConfig) -> (BroadcastManager, Arc<PriceCache>, watch::Sender<FeedState>) {
        let cache = Arc::new(PriceCache::new(Duration::from_secs(30)));
        let (state_tx, state_rx) = watch::channel(FeedState::ConnectedPrimary);
        let manager = BroadcastManager::new(cfg, Arc::clone(&cache), state_rx);
        (manager, cache, state_tx)
    }

    fn put(cache: &PriceCache, symbol: &str, price: rust_decimal::Decimal) {
        cache.set(PriceQuote {
            symbol: symbol.to_string(),
            price,
            observed_at: Utc::now(),
            source: QuoteSource::Primary,
        });
    }

    async fn next_of_type(
        rx: &mut mpsc::Receiver<String>,
        wanted: &str,
    ) -> serde_json::Value {
        timeout(Duration::from_secs(5), async {
            loop {
                let frame = rx.recv().await.expect("frame channel closed");
                let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
                if json["type"] == wanted {
                    return json;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} frame arrived", wanted))
    }

    #[tokio::test]
    async fn test_initial_status_frame() {
        let (manager, _cache, _state) = setup(cfg_fast());
        let (_id, mut rx) = manager.register(SubscriptionFilter::All);

        let json = next_of_type(&mut rx, "status").await;
        assert_eq!(json["state"], "CONNECTED_PRIMARY");
        assert_eq!(json["symbols_cached"], 0);
    }

    #[tokio::test]
    async fn test_tick_delivers_snapshot() {
        let (manager, cache, _state) = setup(cfg_fast());
        put(&cache, "BTCUSDT", dec!(45000.50));

        let (_id, mut rx) = manager.register(SubscriptionFilter::All);
        let json = next_of_type(&mut rx, "price_update").await;
        assert_eq!(json["prices"]["BTCUSDT"], "45000.50");
        assert_eq!(json["source"], "PRIMARY");
    }

    #[tokio::test]
    async fn test_symbol_filter() {
        let (manager, cache, _state) = setup(cfg_fast());
        put(&cache, "BTCUSDT", dec!(45000));
        put(&cache, "ETHUSDT", dec!(2500));

        let (_id, mut rx) = manager.register(SubscriptionFilter::Symbol("ETHUSDT".into()));
        let json = next_of_type(&mut rx, "price_update").await;
        assert_eq!(json["prices"]["ETHUSDT"], "2500");
        assert!(json["prices"].get("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_absent_symbol_sends_nothing() {
        let (manager, cache, _state) = setup(cfg_fast());
        put(&cache, "BTCUSDT", dec!(45000));

        let (_id, mut rx) = manager.register(SubscriptionFilter::Symbol("DOGEUSDT".into()));
        // Initial status arrives, then no price_update frames
        let _ = next_of_type(&mut rx, "status").await;
        let got = timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(got.is_err(), "expected no frames for an absent symbol");
    }

    #[tokio::test]
    async fn test_status_on_state_transition() {
        let mut cfg = cfg_fast();
        cfg.tick_interval_ms = 60_000; // isolate from price ticks
        let (manager, _cache, state_tx) = setup(cfg);

        let (_id, mut rx) = manager.register(SubscriptionFilter::All);
        let _ = next_of_type(&mut rx, "status").await;

        state_tx.send(FeedState::Reconnecting).unwrap();
        let json = next_of_type(&mut rx, "status").await;
        assert_eq!(json["state"], "RECONNECTING");
        assert_eq!(json["source"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped() {
        let (manager, cache, _state) = setup(cfg_fast());
        put(&cache, "BTCUSDT", dec!(45000));

        // Register but never drain the frame channel
        let (_id, rx) = manager.register(SubscriptionFilter::All);
        assert_eq!(manager.connection_count(), 1);

        timeout(Duration::from_secs(5), async {
            while manager.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("slow consumer was never dropped");

        drop(rx);
    }

    #[tokio::test]
    async fn test_remove_stops_delivery() {
        let (manager, cache, _state) = setup(cfg_fast());
        put(&cache, "BTCUSDT", dec!(45000));

        let (id, mut rx) = manager.register(SubscriptionFilter::All);
        let _ = next_of_type(&mut rx, "price_update").await;

        manager.remove(&id);
        assert_eq!(manager.connection_count(), 0);

        // Drain whatever was in flight, then the channel goes quiet
        while matches!(
            timeout(Duration::from_millis(100), rx.recv()).await,
            Ok(Some(_))
        ) {}
    }

    #[tokio::test]
    async fn test_idle_client_pruned() {
        let mut cfg = cfg_fast();
        cfg.keepalive_interval_secs = 0;
        cfg.keepalive_grace_secs = 0;
        let (manager, _cache, _state) = setup(cfg);

        let (_id, _rx) = manager.register(SubscriptionFilter::All);

        timeout(Duration::from_secs(5), async {
            while manager.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("idle client was never pruned");
    }

    #[tokio::test]
    async fn test_touch_keeps_client_alive() {
        let mut cfg = cfg_fast();
        cfg.keepalive_interval_secs = 0;
        cfg.keepalive_grace_secs = 1;
        let (manager, _cache, _state) = setup(cfg);

        let (id, mut rx) = manager.register(SubscriptionFilter::All);
        for _ in 0..10 {
            manager.touch(&id);
            // Keep the channel drained so no slow strikes accrue
            while let Ok(Some(_)) = timeout(Duration::from_millis(1), rx.recv()).await {}
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(manager.connection_count(), 1);
    }
}
