//! Prometheus Metrics Module
//!
//! Process-wide counters for scraping. The per-instance `stats()` structs
//! stay authoritative; these mirror them for dashboards and alerting.
//!
//! # Metrics Categories
//!
//! - **Frames**: received, sent and dropped frames per provider
//! - **Ticks**: ticks rejected by validation
//! - **Connection**: state gauge and reconnection attempts
//! - **Events**: price events dispatched by name, alerts by symbol
//!
//! Until [`init_metrics`] installs the exporter every recording function is
//! a no-op, so library users and tests never need a recorder.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::connection::ConnectionState;

/// Errors raised while installing the exporter.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The exporter or its HTTP listener could not be installed.
    #[error("failed to install Prometheus exporter: {0}")]
    Install(#[from] BuildError),
}

// =============================================================================
// Installation
// =============================================================================

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn register_metrics() {
    describe_counter!(
        "market_stream_frames_received_total",
        "Frames received from the feed"
    );
    describe_counter!(
        "market_stream_frames_sent_total",
        "Frames written to the feed"
    );
    describe_counter!(
        "market_stream_frames_dropped_total",
        "Frames dropped because they could not be decoded"
    );
    describe_counter!(
        "market_stream_ticks_rejected_total",
        "Ticks discarded by validation"
    );
    describe_counter!(
        "market_stream_reconnect_attempts_total",
        "Reconnection attempts"
    );
    describe_gauge!(
        "market_stream_connection_state",
        "0 = disconnected, 1 = connecting, 2 = connected, 3 = reconnecting"
    );
    describe_counter!(
        "market_stream_events_dispatched_total",
        "Price events dispatched on the event bus"
    );
    describe_counter!(
        "market_stream_alerts_triggered_total",
        "Price alerts triggered"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the feed.
pub fn record_frame_received(provider: &'static str) {
    counter!("market_stream_frames_received_total", "provider" => provider).increment(1);
}

/// Record a frame written to the feed.
pub fn record_frame_sent(provider: &'static str) {
    counter!("market_stream_frames_sent_total", "provider" => provider).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_frame_dropped(provider: &'static str) {
    counter!("market_stream_frames_dropped_total", "provider" => provider).increment(1);
}

/// Record a tick discarded by validation.
pub fn record_tick_rejected(provider: &'static str) {
    counter!("market_stream_ticks_rejected_total", "provider" => provider).increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect_attempt(provider: &'static str) {
    counter!("market_stream_reconnect_attempts_total", "provider" => provider).increment(1);
}

/// Publish the current connection state.
pub fn set_connection_state(provider: &'static str, state: ConnectionState) {
    gauge!("market_stream_connection_state", "provider" => provider).set(state_code(state));
}

/// Record a dispatched price event.
pub fn record_event_dispatched(event: &str) {
    counter!(
        "market_stream_events_dispatched_total",
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a triggered alert.
pub fn record_alert_triggered(symbol: &str) {
    counter!(
        "market_stream_alerts_triggered_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

const fn state_code(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Reconnecting => 3.0,
    }
}

// =============================================================================
// Tests
// =============================================================================
