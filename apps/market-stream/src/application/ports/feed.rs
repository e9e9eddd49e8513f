//! Market feed port.
//!
//! What the price stream needs from a live feed: subscription control, a
//! tick callback and connection statistics.

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::connection::ConnectionState;
use crate::domain::subscription::Symbol;
use crate::domain::tick::PriceTick;

/// Callback invoked for every valid tick, in receive order.
pub type TickCallback = Box<dyn Fn(&PriceTick) + Send + Sync>;

/// A subscription change could not be applied.
#[derive(Debug, thiserror::Error)]
#[error("feed {operation} failed: {source}")]
pub struct FeedError {
    /// Operation that failed.
    pub operation: &'static str,
    /// Underlying error.
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl FeedError {
    /// Wrap `source` as a failure of `operation`.
    #[must_use]
    pub fn new(
        operation: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            operation,
            source: source.into(),
        }
    }
}

/// Snapshot of feed connection statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    /// Current connection state.
    pub state: ConnectionState,
    /// Whether the connection is open.
    pub connected: bool,
    /// Seconds since the current connection opened (0 when disconnected).
    pub uptime_secs: f64,
    /// Frames received.
    pub messages_received: u64,
    /// Frames sent.
    pub messages_sent: u64,
    /// Frames dropped because they could not be decoded.
    pub frames_dropped: u64,
    /// Valid ticks delivered to message callbacks.
    pub ticks_received: u64,
    /// Ticks discarded by validation.
    pub ticks_rejected: u64,
    /// Reconnection attempts made.
    pub reconnect_attempts: u64,
    /// Reconnection attempts that succeeded.
    pub reconnections: u64,
    /// Tracked symbols, sorted.
    pub subscriptions: Vec<Symbol>,
    /// Seconds since the feed last sent anything, while connected.
    pub secs_since_activity: Option<f64>,
}

/// A live source of price ticks.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Track `symbols`; returns the ones that were not tracked yet.
    async fn subscribe(&self, symbols: &[Symbol]) -> Result<Vec<Symbol>, FeedError>;

    /// Stop tracking `symbols`; returns the ones that were tracked.
    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<Vec<Symbol>, FeedError>;

    /// Register a tick callback.
    fn on_tick(&self, callback: TickCallback);

    /// Connection statistics.
    fn stats(&self) -> StreamStats;
}
