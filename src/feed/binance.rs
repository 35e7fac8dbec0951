//! Binance WebSocket price feed (primary source)

use super::{FeedError, FeedEvent, FeedSubscription, PriceFeed, PriceQuote, QuoteSource};
use crate::ws::{WsClient, WsConfig, WsConnection, WsEvent};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

/// Binance trade message structure
#[derive(Debug, Deserialize)]
struct BinanceTradeMessage {
    /// Event type
    #[serde(rename = "e")]
    event_type: String,
    /// Symbol
    #[serde(rename = "s")]
    symbol: String,
    /// Price
    #[serde(rename = "p")]
    price: String,
    /// Trade time (milliseconds)
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Binance feed subscribing to `<symbol>@trade` streams
pub struct BinanceFeed {
    url: String,
    symbols: Vec<String>,
}

impl BinanceFeed {
    /// Create a feed for the given endpoint and symbols
    pub fn new(url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            url: url.into(),
            symbols: symbols.into_iter().map(|s| s.to_uppercase()).collect(),
        }
    }

    /// Build the SUBSCRIBE request for all configured trade streams
    fn subscribe_request(&self) -> String {
        let params: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@trade", s.to_lowercase()))
            .collect();

        serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        })
        .to_string()
    }

    /// Parse one inbound message
    ///
    /// `Ok(None)` for recognized non-trade traffic (subscribe acks, other
    /// events); `Err` for payloads that should parse but don't.
    fn parse_message(msg: &str) -> Result<Option<PriceQuote>, String> {
        let value: serde_json::Value =
            serde_json::from_str(msg).map_err(|e| format!("invalid json: {}", e))?;

        // Subscribe ack: {"result":null,"id":1}
        if value.get("id").is_some() {
            return Ok(None);
        }

        let trade: BinanceTradeMessage =
            serde_json::from_value(value).map_err(|e| format!("unexpected shape: {}", e))?;

        if trade.event_type != "trade" {
            return Ok(None);
        }

        let price = Decimal::from_str(&trade.price)
            .map_err(|e| format!("bad price {:?}: {}", trade.price, e))?;
        let observed_at = Utc
            .timestamp_millis_opt(trade.trade_time)
            .single()
            .ok_or_else(|| format!("bad trade time {}", trade.trade_time))?;

        Ok(Some(PriceQuote {
            symbol: trade.symbol,
            price,
            observed_at,
            source: QuoteSource::Primary,
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
                                    tracing::warn!(%detail, "Skipping malformed Binance message");
                                    FeedEvent::ProtocolError { detail }
                                }
                            };
                            if tx.send(out).await.is_err() {
                                tracing::debug!("Feed receiver dropped, stopping Binance feed");
                                return;
                            }
                        }
                        Some(WsEvent::Binary(_)) => {
                            // Binance trade streams are text-only
                        }
                        Some(WsEvent::Closed { reason }) => {
                            tracing::warn!(%reason, "Binance feed disconnected");
                            let _ = tx.send(FeedEvent::Disconnected { reason }).await;
                            return;
                        }
                        None => {
                            tracing::warn!("Binance feed stream ended");
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
                    tracing::info!("Binance feed closed by caller");
                    conn.close();
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    fn source(&self) -> QuoteSource {
        QuoteSource::Primary
    }

    async fn subscribe(&self) -> Result<FeedSubscription, FeedError> {
        tracing::info!(symbols = ?self.symbols, "Subscribing to Binance feed");

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
