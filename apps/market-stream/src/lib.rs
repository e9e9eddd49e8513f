#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream - Real-Time Price Events
//!
//! Keeps one WebSocket connection to a market-data provider (Polygon or
//! Finnhub), normalizes its trade messages into price ticks, and publishes
//! derived price events to in-process listeners.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Provider-agnostic types and rules
//!   - `tick`: Canonical price ticks and validation
//!   - `history`: Bounded per-symbol tick history
//!   - `alert`: Alert conditions and evaluation
//!   - `subscription`: Symbol set tracking
//!   - `connection`: Connection states and lifecycle events
//!
//! - **Application**: Services and port definitions
//!   - `ports`: Transport, market feed, and historical data interfaces
//!   - `services`: The event bus and the price stream
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `stream`: Stream client, provider codecs, WebSocket and loopback
//!     transports, reconnection and heartbeat
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus exporter
//!   - `telemetry`: Tracing and OpenTelemetry setup
//!
//! # Data Flow
//!
//! ```text
//!  Provider WS ──► StreamClient ──► PriceStream ──► EventBus ──► listeners
//!                  (codec, retry,   (change, spike,  (priority,
//!                   heartbeat)       alert, history)  once, "*")
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no I/O.
pub mod domain;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::alert::{AlertConditions, AlertReason, AlertRule};
pub use domain::connection::{ConnectionEvent, ConnectionState};
pub use domain::subscription::Symbol;
pub use domain::tick::{PriceTick, ValidationError};

// Ports
pub use application::ports::{MarketFeed, StreamStats};

// Services
pub use application::services::{
    Event, EventBus, EventBusStats, ListenerId, ListenerOptions, PRICE_ALERT, PRICE_CHANGE,
    PRICE_SPIKE, PRICE_UPDATE, PriceEvent, PriceStream, PriceStreamConfig, PriceStreamError,
    PriceStreamStats, WILDCARD,
};

// Stream client
pub use infrastructure::stream::{
    ListenOutcome, LoopbackConnector, StreamClient, StreamClientConfig, StreamError,
    WebSocketConnector, codec_for,
};

// Configuration
pub use infrastructure::config::{ConfigError, Credentials, Provider, StreamSettings};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
