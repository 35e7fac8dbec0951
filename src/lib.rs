//! price-relay: real-time crypto price aggregation and broadcast relay
//!
//! This library provides the core components for:
//! - Upstream price feeds (Binance primary, Coinbase secondary)
//! - Primary/secondary failover with jittered exponential backoff
//! - A concurrency-safe last-price cache with TTL staleness tracking
//! - WebSocket fan-out to downstream subscribers
//! - Health and metrics aggregation

pub mod aggregator;
pub mod broadcast;
pub mod cache;
pub mod cli;
pub mod config;
pub mod feed;
pub mod health;
pub mod service;
pub mod telemetry;
pub mod ws;
