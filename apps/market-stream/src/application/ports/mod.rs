//! Port Interfaces
//!
//! Contracts that infrastructure adapters implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: opens a framed, bidirectional connection to a feed
//! - `MarketFeed`: subscription control and tick delivery for the price stream
//! - `HistoricalDataPort`: fetches past ticks to seed history

mod feed;
mod historical;
mod transport;

pub use feed::{FeedError, MarketFeed, StreamStats, TickCallback};
pub use historical::{HistoricalDataError, HistoricalDataPort};
pub use transport::{Connection, Connector, FrameSink, FrameSource, TransportError, WireFrame};
