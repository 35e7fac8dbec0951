//! Subscription protocol tests over a real WebSocket connection

mod common;

use common::{quote, test_config, Script, ScriptedFeed};
use futures_util::StreamExt;
use price_relay::feed::{FeedEvent, QuoteSource};
use price_relay::service::PriceRelay;
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn subscribe(relay: &PriceRelay, path: &str) -> WsStream {
    let addr = relay.bound_addr().expect("relay not started");
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, path))
        .await
        .unwrap();
    ws
}

async fn next_of_type(ws: &mut WsStream, wanted: &str) -> serde_json::Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("stream ended").unwrap();
            if let Message::Text(text) = msg {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                if json["type"] == wanted {
                    return json;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} frame arrived", wanted))
}

fn two_symbol_primary() -> std::sync::Arc<ScriptedFeed> {
    ScriptedFeed::new(
        QuoteSource::Primary,
        vec![Script::Emit(vec![
            FeedEvent::Quote(quote("BTCUSDT", dec!(45000), 1000, QuoteSource::Primary)),
            FeedEvent::Quote(quote("ETHUSDT", dec!(2500.25), 1000, QuoteSource::Primary)),
        ])],
    )
}

#[tokio::test]
async fn test_single_symbol_filter_over_websocket() {
    let secondary = ScriptedFeed::new(QuoteSource::Secondary, vec![]);
    let config = test_config(30, 5);
    let mut relay = PriceRelay::with_feeds(&config, two_symbol_primary(), secondary);
    relay.start().await.unwrap();

    let mut ws = subscribe(&relay, "/ws/prices/ethusdt").await;

    let update = next_of_type(&mut ws, "price_update").await;
    assert_eq!(update["prices"]["ETHUSDT"], "2500.25");
    assert!(update["prices"].get("BTCUSDT").is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_all_filter_carries_full_snapshot() {
    let secondary = ScriptedFeed::new(QuoteSource::Secondary, vec![]);
    let config = test_config(30, 5);
    let mut relay = PriceRelay::with_feeds(&config, two_symbol_primary(), secondary);
    relay.start().await.unwrap();

    let mut ws = subscribe(&relay, "/ws/prices").await;

    // Every update reflects one snapshot; once both symbols are cached they
    // arrive together in a single frame
    timeout(Duration::from_secs(5), async {
        loop {
            let update = next_of_type(&mut ws, "price_update").await;
            let prices = update["prices"].as_object().unwrap();
            if prices.len() == 2 {
                assert_eq!(prices["BTCUSDT"], "45000");
                assert_eq!(prices["ETHUSDT"], "2500.25");
                return;
            }
        }
    })
    .await
    .expect("full snapshot never arrived");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_closed() {
    let secondary = ScriptedFeed::new(QuoteSource::Secondary, vec![]);
    let config = test_config(30, 5);
    let mut relay = PriceRelay::with_feeds(&config, two_symbol_primary(), secondary);
    relay.start().await.unwrap();

    let mut ws = subscribe(&relay, "/not/a/thing").await;

    // Server closes without ever sending a frame
    let ended = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(Message::Text(_))) => panic!("unexpected frame on rejected path"),
                _ => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "connection on unknown path was never closed");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_status_sent_on_state_transition() {
    // Primary produces a quote then drops; the transition to RECONNECTING and
    // onwards must be announced to connected subscribers
    let primary = ScriptedFeed::new(
        QuoteSource::Primary,
        vec![Script::Emit(vec![
            FeedEvent::Quote(quote("BTCUSDT", dec!(45000), 1000, QuoteSource::Primary)),
            FeedEvent::Disconnected {
                reason: "reset".into(),
            },
        ])],
    );
    let secondary = ScriptedFeed::new(
        QuoteSource::Secondary,
        vec![Script::Emit(vec![FeedEvent::Quote(quote(
            "BTCUSDT",
            dec!(45010),
            2000,
            QuoteSource::Secondary,
        ))])],
    );

    let config = test_config(30, 2);
    let mut relay = PriceRelay::with_feeds(&config, primary, secondary);
    relay.start().await.unwrap();

    let mut ws = subscribe(&relay, "/ws/prices").await;

    timeout(Duration::from_secs(5), async {
        loop {
            let status = next_of_type(&mut ws, "status").await;
            if status["state"] == "CONNECTED_SECONDARY" {
                assert_eq!(status["source"], "SECONDARY");
                return;
            }
        }
    })
    .await
    .expect("no status frame announced the failover");

    relay.shutdown().await;
}
