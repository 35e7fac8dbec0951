//! Downstream fan-out
//!
//! Subscription registry, shared broadcast tick, wire protocol, and the
//! WebSocket server that carries it. Reads the cache; never touches the
//! upstream feeds.

mod manager;
mod protocol;
mod server;

pub use manager::BroadcastManager;
pub use protocol::{ServerMessage, SubscriptionFilter};
pub use server::BroadcastServer;
