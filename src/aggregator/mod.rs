//! Feed orchestration
//!
//! The aggregator owns the active upstream subscription, the failover state
//! machine, and every cache write.

mod backoff;
mod service;
mod state;

pub use backoff::Backoff;
pub use service::{AggregatorHandle, PriceAggregator};
pub use state::FeedState;
