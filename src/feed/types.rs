//! Price feed types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which upstream venue produced a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteSource {
    Primary,
    Secondary,
}

impl std::fmt::Display for QuoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuoteSource::Primary => write!(f, "PRIMARY"),
            QuoteSource::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// A single normalized price observation from an upstream venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Trading symbol (e.g., "BTCUSDT")
    pub symbol: String,
    /// Last price; Decimal end to end, serialized as a string
    pub price: Decimal,
    /// Venue timestamp of the observation
    pub observed_at: DateTime<Utc>,
    /// Venue that produced the quote
    pub source: QuoteSource,
}

/// Events emitted by a subscribed feed adapter
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A successfully parsed quote
    Quote(PriceQuote),
    /// A single malformed inbound message; logged and skipped, never fatal
    ProtocolError { detail: String },
    /// Terminal: the upstream connection is gone. The event channel closes
    /// after this.
    Disconnected { reason: String },
}

/// Errors establishing a feed subscription
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("websocket error: {0}")]
    Ws(#[from] crate::ws::WsError),
    #[error("subscribe request failed: {0}")]
    Subscribe(String),
}
