//! Upstream price feed adapters
//!
//! One adapter per venue. An adapter owns its WebSocket connection, parses
//! inbound messages into normalized quotes, and surfaces connection loss as a
//! terminal event for the aggregator to react to.

mod binance;
mod coinbase;
mod types;

pub use binance::BinanceFeed;
pub use coinbase::CoinbaseFeed;
pub use types::{FeedError, FeedEvent, PriceQuote, QuoteSource};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A live feed subscription: an event stream plus a close handle
pub struct FeedSubscription {
    events: mpsc::Receiver<FeedEvent>,
    closer: Option<tokio::sync::oneshot::Sender<()>>,
}

impl FeedSubscription {
    pub fn new(
        events: mpsc::Receiver<FeedEvent>,
        closer: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            closer: Some(closer),
        }
    }

    /// Receive the next feed event; `None` once the adapter task has exited
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Gracefully tear down the subscription and its connection
    pub fn close(&mut self) {
        if let Some(tx) = self.closer.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Trait for price feed implementations
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Which source tag this adapter stamps on its quotes
    fn source(&self) -> QuoteSource;

    /// Open the upstream connection and start streaming quotes
    async fn subscribe(&self) -> Result<FeedSubscription, FeedError>;
}
