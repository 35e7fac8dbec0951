//! Coinbase Exchange WebSocket price feed (secondary source)

use super::{FeedError, FeedEvent, FeedSubscription, PriceFeed, PriceQuote, QuoteSource};
use crate::ws::{WsClient, WsConfig, WsConnection, WsEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

/// Coinbase ticker message structure
#[derive(Debug, Deserialize)]
struct CoinbaseTickerMessage {
    #[serde(rename = "type")]
    message_type: String,
    product_id: String,
    price: String,
    time: DateTime<Utc>,
}

/// Coinbase feed subscribing to the `ticker` channel
///
/// Symbols are configured in Binance convention ("BTCUSDT") and mapped to
/// Coinbase product ids ("BTC-USD") on the wire, then back on the way in, so
/// both feeds populate the same cache keys.
pub struct CoinbaseFeed {
    url: String,
    symbols: Vec<String>,
}

impl CoinbaseFeed {
    /// Create a feed for the given endpoint and symbols
    pub fn new(url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            url: url.into(),
            symbols: symbols.into_iter().map(|s| s.to_uppercase()).collect(),
        }
    }

    /// "BTCUSDT" -> "BTC-USD"
    fn product_id_for(symbol: &str) -> String {
        let base = symbol
            .strip_suffix("USDT")
            .or_else(|| symbol.strip_suffix("USD"))
            .unwrap_or(symbol);
        format!("{}-USD", base)
    }

    /// "BTC-USD" -> "BTCUSDT"
    fn symbol_for(product_id: &str) -> String {
        match product_id.split_once('-') {
            Some((base, _quote)) => format!("{}USDT", base),
            None => product_id.to_string(),
        }
    }

    fn subscribe_request(&self) -> String {
        let product_ids: Vec<String> = self
            .symbols
            .iter()
            .map(|s| Self::product_id_for(s))
            .collect();

        serde_json::json!({
            "type": "subscribe",
            "product_ids": product_ids,
            "channels": ["ticker"],
        })
        .to_string()
    }

    /// Parse one inbound message; `Ok(None)` for non-ticker traffic
    fn parse_message(msg: &str) -> Result<Option<PriceQuote>, String> {
        let value: serde_json::Value =
            serde_json::from_str(msg).map_err(|e| format!("invalid json: {}", e))?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some("ticker") => {}
            Some("error") => {
                let reason = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown");
                return Err(format!("upstream error: {}", reason));
            }
            // subscriptions ack, heartbeat, etc.
            Some(_) => return Ok(None),
            None => return Err("missing type field".to_string()),
        }

        let ticker: CoinbaseTickerMessage =
            serde_json::from_value(value).map_err(|e| format!("unexpected shape: {}", e))?;

        let price = Decimal::from_str(&ticker.price)
            .map_err(|e| format!("bad price {:?}: {}", ticker.price, e))?;

        Ok(Some(PriceQuote {
            symbol: Self::symbol_for(&ticker.product_id),
            price,
            observed_at: ticker.time,
            source: QuoteSource::Secondary,
        }))
    }

    async fn run_message_loop(
        mut conn: WsConnection,
        tx: mpsc::Sender<FeedEvent>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = conn.recv() => {
                    match event {
                        Some(WsEvent::Text(text)) => {
                            let out = match Self::parse_message(&text) {
                                Ok(Some(quote)) => FeedEvent::Quote(quote),
                                Ok(None) => continue,
                                Err(detail) => {
                                    tracing::warn!(%detail, "Skipping malformed Coinbase message");
                                    FeedEvent::ProtocolError { detail }
                                }
                            };
                            if tx.send(out).await.is_err() {
                                tracing::debug!("Feed receiver dropped, stopping Coinbase feed");
                                return;
                            }
                        }
                        Some(WsEvent::Binary(_)) => {}
                        Some(WsEvent::Closed { reason }) => {
                            tracing::warn!(%reason, "Coinbase feed disconnected");
                            let _ = tx.send(FeedEvent::Disconnected { reason }).await;
                            return;
                        }
                        None => {
                            tracing::warn!("Coinbase feed stream ended");
                            let _ = tx
                                .send(FeedEvent::Disconnected {
                                    reason: "stream ended".to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
                _ = &mut close_rx => {
                    tracing::info!("Coinbase feed closed by caller");
                    conn.close();
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl PriceFeed for CoinbaseFeed {
    fn source(&self) -> QuoteSource {
        QuoteSource::Secondary
    }

    async fn subscribe(&self) -> Result<FeedSubscription, FeedError> {
        tracing::info!(symbols = ?self.symbols, "Subscribing to Coinbase feed");

        let client = WsClient::new(WsConfig::new(&self.url));
        let conn = client.connect().await?;

        conn.send_text(self.subscribe_request())
            .await
            .map_err(|e| FeedError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(1024);
        let (close_tx, close_rx) = oneshot::channel();

        tokio::spawn(async move {
            Self::run_message_loop(conn, tx, close_rx).await;
        });

        Ok(FeedSubscription::new(rx, close_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_product_id_mapping() {
        assert_eq!(CoinbaseFeed::product_id_for("BTCUSDT"), "BTC-USD");
        assert_eq!(CoinbaseFeed::product_id_for("ETHUSD"), "ETH-USD");
        assert_eq!(CoinbaseFeed::symbol_for("BTC-USD"), "BTCUSDT");
    }

    #[test]
    fn test_subscribe_request() {
        let feed = CoinbaseFeed::new("wss://example", vec!["BTCUSDT".to_string()]);
        let req: serde_json::Value = serde_json::from_str(&feed.subscribe_request()).unwrap();
        assert_eq!(req["type"], "subscribe");
        assert_eq!(req["product_ids"][0], "BTC-USD");
        assert_eq!(req["channels"][0], "ticker");
    }

    #[test]
    fn test_parse_valid_ticker() {
        let msg = r#"{
            "type": "ticker",
            "sequence": 12345,
            "product_id": "BTC-USD",
            "price": "45010.00",
            "time": "2024-01-01T00:00:00.123Z"
        }"#;

        let quote = CoinbaseFeed::parse_message(msg).unwrap().unwrap();
        assert_eq!(quote.symbol, "BTCUSDT");
        assert_eq!(quote.price, dec!(45010.00));
        assert_eq!(quote.source, QuoteSource::Secondary);
    }

    #[test]
    fn test_parse_subscriptions_ack_skipped() {
        let msg = r#"{"type":"subscriptions","channels":[]}"#;
        assert!(CoinbaseFeed::parse_message(msg).unwrap().is_none());
    }

    #[test]
    fn test_parse_upstream_error() {
        let msg = r#"{"type":"error","message":"Failed to subscribe"}"#;
        let err = CoinbaseFeed::parse_message(msg).unwrap_err();
        assert!(err.contains("Failed to subscribe"));
    }

    #[test]
    fn test_parse_invalid_json_is_error() {
        assert!(CoinbaseFeed::parse_message("{{{").is_err());
    }
}
