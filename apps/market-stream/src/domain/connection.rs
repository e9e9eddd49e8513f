//! Connection lifecycle.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!      ▲                        │                  │ failure
//!      │ disconnect / exhausted │ fail             ▼
//!      └────────────────── Reconnecting ◄──────────┘
//! ```

use std::time::Duration;

use serde::Serialize;

/// State of a stream client's upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection. Initial state, and terminal after a manual
    /// disconnect or exhausted retries.
    #[default]
    Disconnected,
    /// Transport and protocol handshake in progress.
    Connecting,
    /// Handshake complete; frames are flowing.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Whether frames can be sent and received.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications delivered to connection callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected {
        /// Endpoint the client connected to (credentials stripped).
        endpoint: String,
    },
    /// Connection is gone and no automatic retry will follow.
    Disconnected,
    /// A reconnection attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Every allowed attempt failed; the client stays disconnected.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
}
