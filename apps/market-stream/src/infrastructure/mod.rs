//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the ports defined in the application layer,
//! plus the process-level concerns of the service binary.

/// Configuration from environment variables.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Feed connection: stream client, codecs and transports.
pub mod stream;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
