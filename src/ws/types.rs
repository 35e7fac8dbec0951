//! WebSocket types and configuration

use std::time::Duration;

/// WebSocket client configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// WebSocket URL to connect to
    pub url: String,
    /// Timeout for the initial connection handshake
    pub connect_timeout: Duration,
    /// Interval for sending ping frames
    pub ping_interval: Duration,
    /// Timeout for pong response
    pub pong_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConfig {
    /// Create a new config with the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set connection handshake timeout
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    /// Set ping interval
    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.ping_interval = d;
        self
    }

    /// Set pong timeout
    pub fn pong_timeout(mut self, d: Duration) -> Self {
        self.pong_timeout = d;
        self
    }
}

/// Events surfaced by a live WebSocket connection
#[derive(Debug, Clone)]
pub enum WsEvent {
    /// Text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
    /// Connection ended; no further events follow
    Closed { reason: String },
}

/// WebSocket errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum WsError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("send failed: {0}")]
    SendFailed(String),
}
