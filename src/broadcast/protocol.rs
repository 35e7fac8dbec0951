//! Downstream subscription wire protocol
//!
//! One JSON message per WebSocket text frame.

use crate::aggregator::FeedState;
use crate::cache::CachedQuote;
use crate::feed::QuoteSource;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// What a connection wants to receive, chosen at connection time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Full cache snapshot every tick
    All,
    /// One symbol only
    Symbol(String),
}

impl SubscriptionFilter {
    /// The filtered view of a cache snapshot; `None` means nothing to send
    /// this tick (single-symbol filter with the symbol absent).
    pub fn apply<'a>(
        &self,
        snapshot: &'a HashMap<String, CachedQuote>,
    ) -> Option<BTreeMap<String, &'a CachedQuote>> {
        match self {
            SubscriptionFilter::All => {
                Some(snapshot.iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            SubscriptionFilter::Symbol(symbol) => {
                let entry = snapshot.get(symbol)?;
                let mut view = BTreeMap::new();
                view.insert(symbol.clone(), entry);
                Some(view)
            }
        }
    }
}

/// Server -> client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Prices from one atomic cache snapshot
    PriceUpdate {
        /// symbol -> price, Decimal serialized as a string
        prices: BTreeMap<String, Decimal>,
        timestamp: DateTime<Utc>,
        source: Option<QuoteSource>,
    },
    /// Feed state, sent on connect and on every state transition
    Status {
        state: FeedState,
        source: Option<QuoteSource>,
        symbols_cached: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn price_update(
        view: &BTreeMap<String, &CachedQuote>,
        source: Option<QuoteSource>,
    ) -> Self {
        ServerMessage::PriceUpdate {
            prices: view
                .iter()
                .map(|(symbol, cached)| (symbol.clone(), cached.quote.price))
                .collect(),
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn status(state: FeedState, symbols_cached: usize) -> Self {
        ServerMessage::Status {
            state,
            source: state.active_source(),
            symbols_cached,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize server message");
            String::from("{}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cached(symbol: &str, price: Decimal) -> CachedQuote {
        CachedQuote {
            quote: crate::feed::PriceQuote {
                symbol: symbol.to_string(),
                price,
                observed_at: Utc::now(),
                source: QuoteSource::Primary,
            },
            cached_at: Utc::now(),
            stale: false,
        }
    }

    #[test]
    fn test_filter_all() {
        let mut snapshot = HashMap::new();
        snapshot.insert("BTCUSDT".to_string(), cached("BTCUSDT", dec!(45000)));
        snapshot.insert("ETHUSDT".to_string(), cached("ETHUSDT", dec!(2500)));

        let view = SubscriptionFilter::All.apply(&snapshot).unwrap();
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_filter_single_symbol() {
        let mut snapshot = HashMap::new();
        snapshot.insert("BTCUSDT".to_string(), cached("BTCUSDT", dec!(45000)));
        snapshot.insert("ETHUSDT".to_string(), cached("ETHUSDT", dec!(2500)));

        let filter = SubscriptionFilter::Symbol("BTCUSDT".to_string());
        let view = filter.apply(&snapshot).unwrap();
        assert_eq!(view.len(), 1);
        assert!(view.contains_key("BTCUSDT"));
    }

    #[test]
    fn test_filter_absent_symbol() {
        let snapshot = HashMap::new();
        let filter = SubscriptionFilter::Symbol("DOGEUSDT".to_string());
        assert!(filter.apply(&snapshot).is_none());
    }

    #[test]
    fn test_price_update_wire_format() {
        let mut snapshot = HashMap::new();
        snapshot.insert("BTCUSDT".to_string(), cached("BTCUSDT", dec!(45000.50)));
        let view = SubscriptionFilter::All.apply(&snapshot).unwrap();

        let msg = ServerMessage::price_update(&view, Some(QuoteSource::Primary));
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();

        assert_eq!(json["type"], "price_update");
        assert_eq!(json["prices"]["BTCUSDT"], "45000.50");
        assert_eq!(json["source"], "PRIMARY");
    }

    #[test]
    fn test_status_wire_format() {
        let msg = ServerMessage::status(FeedState::ConnectedSecondary, 3);
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();

        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "CONNECTED_SECONDARY");
        assert_eq!(json["source"], "SECONDARY");
        assert_eq!(json["symbols_cached"], 3);
    }

    #[test]
    fn test_status_no_source_while_reconnecting() {
        let msg = ServerMessage::status(FeedState::Reconnecting, 1);
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["source"], serde_json::Value::Null);
    }
}
