//! Feed Transport Port (Driven Port)
//!
//! A connection is split into a sink and a source at open time so that one
//! task reads while writes are serialized elsewhere.

use async_trait::async_trait;

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Liveness probe.
    Ping(Vec<u8>),
    /// Liveness probe reply.
    Pong(Vec<u8>),
    /// Close handshake.
    Close,
}

/// Transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Could not open the connection.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Endpoint with credentials stripped.
        endpoint: String,
        /// Underlying failure.
        reason: String,
    },

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The peer went away.
    #[error("connection closed")]
    Closed,
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Start the close handshake.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame in arrival order. `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<WireFrame, TransportError>>;
}

/// An open connection.
pub struct Connection {
    /// Write half.
    pub sink: Box<dyn FrameSink>,
    /// Read half.
    pub source: Box<dyn FrameSource>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to a feed endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}
