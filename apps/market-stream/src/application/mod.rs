//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the event bus, the price stream service, and the
//! port interfaces that define how they reach external systems.

/// Port interfaces for external systems (feed transport, historical data).
pub mod ports;

/// Application services: event dispatch and price processing.
pub mod services;
