//! WebSocket client library
//!
//! Provides a single-connection WebSocket client with ping/pong handling.
//! Reconnect policy lives with the caller (the aggregator), not here.

mod client;
mod types;

pub use client::{WsClient, WsConnection};
pub use types::{WsConfig, WsError, WsEvent};
