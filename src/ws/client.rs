//! Single-connection WebSocket client
//!
//! Deliberately does NOT reconnect on its own: connection loss surfaces as a
//! terminal `Closed` event and the caller decides the retry policy.

use super::types::{WsConfig, WsError, WsEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// WebSocket client for one upstream endpoint
pub struct WsClient {
    config: WsConfig,
}

/// Handle to a live connection: an event stream plus a close handle
pub struct WsConnection {
    events: mpsc::Receiver<WsEvent>,
    close_tx: Option<oneshot::Sender<()>>,
    send_tx: mpsc::Sender<String>,
}

impl WsConnection {
    /// Receive the next event; `None` after the connection has fully closed
    pub async fn recv(&mut self) -> Option<WsEvent> {
        self.events.recv().await
    }

    /// Send a text frame to the server (e.g., a subscribe request)
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.send_tx
            .send(text.into())
            .await
            .map_err(|_| WsError::SendFailed("connection task gone".into()))
    }

    /// Gracefully close the connection
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl WsClient {
    /// Create a new WebSocket client with the given configuration
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    /// Create a new client with just a URL using default config
    pub fn with_url(url: impl Into<String>) -> Self {
        Self::new(WsConfig::new(url))
    }

    /// Get the configured URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Establish the connection and spawn the read loop
    ///
    /// Returns once the handshake completes. The spawned task emits `Text` and
    /// `Binary` events, answers server pings, issues its own pings, and emits a
    /// final `Closed` event on any terminal condition (close frame, stream
    /// error, pong timeout, or an explicit `close()` call).
    pub async fn connect(&self) -> Result<WsConnection, WsError> {
        tracing::info!(url = %self.config.url, "Connecting to WebSocket");

        let (ws_stream, _response) = timeout(self.config.connect_timeout, connect_async(&self.config.url))
            .await
            .map_err(|_| WsError::ConnectTimeout(self.config.connect_timeout))?
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = %self.config.url, "WebSocket connected");

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (send_tx, send_rx) = mpsc::channel(64);
        let (close_tx, close_rx) = oneshot::channel();
        let config = self.config.clone();

        tokio::spawn(async move {
            Self::run_stream(config, ws_stream, event_tx, send_rx, close_rx).await;
        });

        Ok(WsConnection {
            events: event_rx,
            close_tx: Some(close_tx),
            send_tx,
        })
    }

    async fn run_stream(
        config: WsConfig,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        tx: mpsc::Sender<WsEvent>,
        mut send_rx: mpsc::Receiver<String>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so the ping cadence starts one
        // interval after connect.
        ping_interval.tick().await;

        let mut pong_deadline: Option<tokio::time::Instant> = None;

        let reason = loop {
            let pong_check = async {
                match pong_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if tx.send(WsEvent::Text(text)).await.is_err() {
                                tracing::debug!("Receiver dropped, closing connection");
                                break "receiver dropped".to_string();
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if tx.send(WsEvent::Binary(data)).await.is_err() {
                                break "receiver dropped".to_string();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                break "pong send failed".to_string();
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pong_deadline = None;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Received close frame");
                            break "server closed".to_string();
                        }
                        Some(Err(e)) => {
                            break format!("stream error: {}", e);
                        }
                        None => {
                            break "stream ended".to_string();
                        }
                        _ => {}
                    }
                }

                out = send_rx.recv() => {
                    match out {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                break format!("send failed: {}", e);
                            }
                        }
                        None => {
                            // Connection handle gone, nobody is listening
                            let _ = write.send(Message::Close(None)).await;
                            break "connection handle dropped".to_string();
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(vec![])).await.is_err() {
                        break "ping send failed".to_string();
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(tokio::time::Instant::now() + config.pong_timeout);
                    }
                }

                _ = pong_check => {
                    break "pong timeout".to_string();
                }

                _ = &mut close_rx => {
                    let _ = write.send(Message::Close(None)).await;
                    break "closed by caller".to_string();
                }
            }
        };

        tracing::debug!(reason = %reason, "WebSocket stream ended");
        let _ = tx.send(WsEvent::Closed { reason }).await;
    }
}
