//! Domain Layer - Core market data types and rules.
//!
//! Provider-agnostic types with no I/O: canonical ticks, bounded price
//! history, alert rules, the subscription set, and connection state.

/// Alert rules and their evaluation.
pub mod alert;

/// Connection lifecycle states and events.
pub mod connection;

/// Bounded per-symbol tick history.
pub mod history;

/// Symbol subscription tracking.
pub mod subscription;

/// Canonical price ticks and validation.
pub mod tick;
