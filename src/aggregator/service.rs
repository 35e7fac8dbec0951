//! Price aggregator: single cache writer and failover state machine
//!
//! One long-lived task owns the active feed subscription and is the only
//! writer to the cache. On silence or connection loss it fails over to the
//! secondary feed while primary reconnect attempts continue in the background;
//! a fresh primary quote preempts the secondary.

use super::backoff::Backoff;
use super::state::FeedState;
use crate::cache::PriceCache;
use crate::config::AggregatorConfig;
use crate::feed::{FeedEvent, FeedSubscription, PriceFeed, PriceQuote, QuoteSource};
use crate::health::RelayMetrics;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

/// Why an active subscription stopped being consumed
enum Exit {
    Shutdown,
    Lost,
}

/// How a failover window ended
enum FailoverExit {
    Shutdown,
    PrimaryRestored {
        sub: FeedSubscription,
        first: PriceQuote,
    },
}

/// Handle to the running aggregator task
pub struct AggregatorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl AggregatorHandle {
    /// Signal shutdown and wait for the task to wind down
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Aggregator task did not shut down cleanly");
        }
    }
}

/// Orchestrates exactly one active feed at a time and writes into the cache
pub struct PriceAggregator {
    cfg: AggregatorConfig,
    primary: Arc<dyn PriceFeed>,
    secondary: Arc<dyn PriceFeed>,
    cache: Arc<PriceCache>,
    metrics: Arc<RelayMetrics>,
    state_tx: watch::Sender<FeedState>,
}

impl PriceAggregator {
    pub fn new(
        cfg: AggregatorConfig,
        primary: Arc<dyn PriceFeed>,
        secondary: Arc<dyn PriceFeed>,
        cache: Arc<PriceCache>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(FeedState::Disconnected);
        Self {
            cfg,
            primary,
            secondary,
            cache,
            metrics,
            state_tx,
        }
    }

    /// Subscribe to state transitions (for broadcast status frames and health)
    pub fn state_receiver(&self) -> watch::Receiver<FeedState> {
        self.state_tx.subscribe()
    }

    /// Spawn the aggregator task
    pub fn start(self) -> AggregatorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        AggregatorHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        'outer: loop {
            self.set_state(FeedState::Connecting);

            let attempt = tokio::select! {
                r = self.primary.subscribe() => r,
                _ = &mut shutdown => break 'outer,
            };

            let mut active = match attempt {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(error = %e, "Primary feed unavailable at connect");
                    self.metrics.record_connection_error();
                    None
                }
            };

            loop {
                if let Some(sub) = active.take() {
                    match self.consume(sub, QuoteSource::Primary, &mut shutdown).await {
                        Exit::Shutdown => break 'outer,
                        Exit::Lost => self.metrics.record_connection_error(),
                    }
                }

                self.set_state(FeedState::Reconnecting);
                match self.failover(&mut shutdown).await {
                    FailoverExit::Shutdown => break 'outer,
                    FailoverExit::PrimaryRestored { sub, first } => {
                        tracing::info!("Primary feed restored, preempting secondary");
                        self.set_state(FeedState::ConnectedPrimary);
                        self.apply(first);
                        active = Some(sub);
                    }
                }
            }
        }

        self.set_state(FeedState::Disconnected);
        tracing::info!("Aggregator stopped");
    }

    /// Consume one live subscription until shutdown, disconnect, or silence
    async fn consume(
        &self,
        mut sub: FeedSubscription,
        source: QuoteSource,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Exit {
        let connected_state = match source {
            QuoteSource::Primary => FeedState::ConnectedPrimary,
            QuoteSource::Secondary => FeedState::ConnectedSecondary,
        };

        loop {
            tokio::select! {
                event = timeout(self.cfg.silence_window(), sub.recv()) => {
                    match event {
                        Ok(Some(FeedEvent::Quote(quote))) => {
                            self.set_state(connected_state);
                            self.apply(quote);
                        }
                        Ok(Some(FeedEvent::ProtocolError { detail })) => {
                            tracing::warn!(%detail, %source, "Feed protocol error");
                            self.metrics.record_protocol_error();
                        }
                        Ok(Some(FeedEvent::Disconnected { reason })) => {
                            tracing::warn!(%reason, %source, "Feed connection lost");
                            return Exit::Lost;
                        }
                        Ok(None) => {
                            tracing::warn!(%source, "Feed event channel closed");
                            return Exit::Lost;
                        }
                        Err(_) => {
                            tracing::warn!(
                                %source,
                                silence_secs = self.cfg.silence_window_secs,
                                "Feed silent past the silence window, treating as failed"
                            );
                            sub.close();
                            return Exit::Lost;
                        }
                    }
                }
                _ = &mut *shutdown => {
                    sub.close();
                    return Exit::Shutdown;
                }
            }
        }
    }

    /// Serve from the secondary feed while retrying the primary in the
    /// background. Returns when the primary produced a fresh quote or on
    /// shutdown; if both feeds are down this loops indefinitely, leaving the
    /// cache to age rather than crashing.
    async fn failover(&self, shutdown: &mut oneshot::Receiver<()>) -> FailoverExit {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let retry_task = tokio::spawn(Self::retry_primary(
            Arc::clone(&self.primary),
            self.cfg.clone(),
            Arc::clone(&self.metrics),
            ready_tx,
            cancel_rx,
        ));

        let mut primary_ready = Some(ready_rx);
        let mut secondary: Option<FeedSubscription> = None;
        let mut secondary_backoff = Backoff::new(self.cfg.backoff_base(), self.cfg.backoff_cap());

        let outcome = 'fail: loop {
            // Lazily (re)establish the secondary subscription
            if secondary.is_none() {
                let attempt = tokio::select! {
                    r = self.secondary.subscribe() => r,
                    ready = Self::recv_ready(&mut primary_ready) => {
                        match ready {
                            Some((sub, first)) => break 'fail FailoverExit::PrimaryRestored { sub, first },
                            None => continue 'fail,
                        }
                    }
                    _ = &mut *shutdown => break 'fail FailoverExit::Shutdown,
                };

                match attempt {
                    Ok(sub) => {
                        secondary = Some(sub);
                        secondary_backoff.reset();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Secondary feed unavailable");
                        self.metrics.record_connection_error();
                        let delay = secondary_backoff.next_delay();
                        self.metrics.record_reconnect();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            ready = Self::recv_ready(&mut primary_ready) => {
                                if let Some((sub, first)) = ready {
                                    break 'fail FailoverExit::PrimaryRestored { sub, first };
                                }
                            }
                            _ = &mut *shutdown => break 'fail FailoverExit::Shutdown,
                        }
                    }
                }
                continue 'fail;
            }

            let sub = secondary.as_mut().unwrap();
            tokio::select! {
                event = timeout(self.cfg.silence_window(), sub.recv()) => {
                    match event {
                        Ok(Some(FeedEvent::Quote(quote))) => {
                            // Transition fully before the first secondary write
                            self.set_state(FeedState::ConnectedSecondary);
                            self.apply(quote);
                        }
                        Ok(Some(FeedEvent::ProtocolError { detail })) => {
                            tracing::warn!(%detail, "Secondary feed protocol error");
                            self.metrics.record_protocol_error();
                        }
                        Ok(Some(FeedEvent::Disconnected { reason })) => {
                            tracing::warn!(%reason, "Secondary feed connection lost");
                            self.metrics.record_connection_error();
                            secondary = None;
                            self.set_state(FeedState::Reconnecting);
                        }
                        Ok(None) => {
                            tracing::warn!("Secondary feed event channel closed");
                            self.metrics.record_connection_error();
                            secondary = None;
                            self.set_state(FeedState::Reconnecting);
                        }
                        Err(_) => {
                            tracing::warn!("Secondary feed silent past the silence window");
                            if let Some(mut s) = secondary.take() {
                                s.close();
                            }
                            self.metrics.record_connection_error();
                            self.set_state(FeedState::Reconnecting);
                        }
                    }
                }
                ready = Self::recv_ready(&mut primary_ready) => {
                    if let Some((sub, first)) = ready {
                        break 'fail FailoverExit::PrimaryRestored { sub, first };
                    }
                }
                _ = &mut *shutdown => break 'fail FailoverExit::Shutdown,
            }
        };

        let _ = cancel_tx.send(());
        retry_task.abort();
        if let Some(mut sub) = secondary {
            sub.close();
        }
        outcome
    }

    /// Await the background primary retry result; once the channel reports
    /// closed it is disarmed so later polls park forever instead of spinning.
    async fn recv_ready(
        rx: &mut Option<mpsc::Receiver<(FeedSubscription, PriceQuote)>>,
    ) -> Option<(FeedSubscription, PriceQuote)> {
        match rx {
            Some(inner) => match inner.recv().await {
                Some(ready) => Some(ready),
                None => {
                    *rx = None;
                    None
                }
            },
            None => std::future::pending().await,
        }
    }

    /// Background task: reattempt the primary feed on jittered exponential
    /// backoff until it yields a first quote. The quote is handed back over
    /// the channel and written only after the aggregator has transitioned, so
    /// the single-writer discipline holds.
    async fn retry_primary(
        primary: Arc<dyn PriceFeed>,
        cfg: AggregatorConfig,
        metrics: Arc<RelayMetrics>,
        ready_tx: mpsc::Sender<(FeedSubscription, PriceQuote)>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let mut backoff = Backoff::new(cfg.backoff_base(), cfg.backoff_cap());

        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut cancel => return,
            }

            metrics.record_reconnect();
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reattempting primary feed");

            let attempt = tokio::select! {
                r = primary.subscribe() => r,
                _ = &mut cancel => return,
            };

            let mut sub = match attempt {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::debug!(error = %e, "Primary reattempt failed");
                    metrics.record_connection_error();
                    continue;
                }
            };

            // Only a fresh quote counts as "primary is back"
            loop {
                let event = tokio::select! {
                    e = timeout(cfg.silence_window(), sub.recv()) => e,
                    _ = &mut cancel => return,
                };

                match event {
                    Ok(Some(FeedEvent::Quote(quote))) => {
                        let _ = ready_tx.send((sub, quote)).await;
                        return;
                    }
                    Ok(Some(FeedEvent::ProtocolError { .. })) => {
                        metrics.record_protocol_error();
                    }
                    Ok(Some(FeedEvent::Disconnected { .. })) | Ok(None) | Err(_) => {
                        metrics.record_connection_error();
                        break;
                    }
                }
            }
        }
    }

    fn apply(&self, quote: PriceQuote) {
        self.metrics.record_update();
        if !self.cache.set(quote) {
            // Late arrival from a superseded source; already logged by the cache
        }
    }

    fn set_state(&self, state: FeedState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::info!(from = %current, to = %state, "Feed state transition");
                *current = state;
                true
            }
        });
    }
}
