//! Feed connection state

use crate::feed::QuoteSource;
use serde::Serialize;

/// Process-wide feed state, owned exclusively by the aggregator task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedState {
    Disconnected,
    Connecting,
    ConnectedPrimary,
    ConnectedSecondary,
    Reconnecting,
}

impl FeedState {
    /// True while quotes are flowing from one of the two sources
    pub fn is_connected(&self) -> bool {
        matches!(self, FeedState::ConnectedPrimary | FeedState::ConnectedSecondary)
    }

    /// The source currently feeding the cache, if any
    pub fn active_source(&self) -> Option<QuoteSource> {
        match self {
            FeedState::ConnectedPrimary => Some(QuoteSource::Primary),
            FeedState::ConnectedSecondary => Some(QuoteSource::Secondary),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeedState::Disconnected => "DISCONNECTED",
            FeedState::Connecting => "CONNECTING",
            FeedState::ConnectedPrimary => "CONNECTED_PRIMARY",
            FeedState::ConnectedSecondary => "CONNECTED_SECONDARY",
            FeedState::Reconnecting => "RECONNECTING",
        };
        write!(f, "{}", s)
    }
}
