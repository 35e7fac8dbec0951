//! WebSocket server for downstream subscribers
//!
//! Bridges accepted connections to the broadcast manager: the request path
//! selects the filter, frames flow from the manager's channel to the socket,
//! pongs flow back as keep-alive activity.

use super::manager::BroadcastManager;
use super::protocol::SubscriptionFilter;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Accept loop for the subscription endpoint
pub struct BroadcastServer {
    manager: Arc<BroadcastManager>,
    listener: TcpListener,
}

impl BroadcastServer {
    /// Bind the configured listen address
    pub async fn bind(manager: Arc<BroadcastManager>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&manager.config().bind_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Subscription server listening");
        Ok(Self { manager, listener })
    }

    /// The actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal fires
    pub async fn serve(self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let manager = Arc::clone(&self.manager);
                            tokio::spawn(async move {
                                Self::handle_connection(manager, stream, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept subscriber");
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Subscription server shutting down");
                    return;
                }
            }
        }
    }

    /// `/ws/prices` -> ALL, `/ws/prices/{SYMBOL}` -> that symbol
    fn parse_filter(path: &str) -> Option<SubscriptionFilter> {
        let path = path.trim_end_matches('/');
        if path == "/ws/prices" {
            return Some(SubscriptionFilter::All);
        }
        path.strip_prefix("/ws/prices/")
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .map(|s| SubscriptionFilter::Symbol(s.to_uppercase()))
    }

    async fn handle_connection(
        manager: Arc<BroadcastManager>,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let mut path = String::new();
        let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let filter = match Self::parse_filter(&path) {
            Some(filter) => filter,
            None => {
                tracing::debug!(%peer, %path, "Rejecting unknown subscription path");
                let mut ws = ws;
                let _ = ws.close(None).await;
                return;
            }
        };

        let (id, mut frames) = manager.register(filter);
        tracing::debug!(%peer, connection = %id, %path, "Subscriber connected");

        let (mut write, mut read) = ws.split();
        let ping_period = manager
            .config()
            .keepalive_interval()
            .max(Duration::from_millis(100));
        let mut ping = tokio::time::interval(ping_period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Some(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        // Manager pruned us (slow consumer or keep-alive lapse)
                        None => break,
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Pong(_))) => manager.touch(&id),
                        Some(Ok(Message::Ping(data))) => {
                            manager.touch(&id);
                            if write.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Clients have nothing else to say to us
                        }
                        Some(Err(e)) => {
                            tracing::debug!(connection = %id, error = %e, "Subscriber stream error");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if write.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }

        manager.remove(&id);
        let _ = write.close().await;
        tracing::debug!(%peer, connection = %id, "Subscriber disconnected");
    }
}
