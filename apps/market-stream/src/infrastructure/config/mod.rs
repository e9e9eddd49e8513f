//! Configuration Module
//!
//! Environment-driven configuration for the stream client, price stream,
//! and service binary.

mod settings;

pub use settings::{
    ConfigError, Credentials, HeartbeatSettings, PriceSettings, Provider, ReconnectSettings,
    StreamSettings,
};
