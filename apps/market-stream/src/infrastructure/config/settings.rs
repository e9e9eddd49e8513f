//! Stream Configuration Settings
//!
//! Configuration types for the market stream, loaded from environment
//! variables prefixed with `MARKET_STREAM_`.

use std::time::Duration;

use crate::application::services::PriceStreamConfig;
use crate::domain::subscription::normalize_symbol;

const DEFAULT_ENDPOINT: &str = "wss://socket.polygon.io/stocks";

/// Upstream market-data provider, selecting the wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    /// Polygon.io stocks cluster.
    #[default]
    Polygon,
    /// Finnhub trades stream.
    Finnhub,
}

impl Provider {
    /// Parse provider name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "polygon" => Some(Self::Polygon),
            "finnhub" => Some(Self::Finnhub),
            _ => None,
        }
    }

    /// Provider name for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Polygon => "polygon",
            Self::Finnhub => "finnhub",
        }
    }
}

/// Provider API credential.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Retry unexpected disconnects.
    pub enabled: bool,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay (fraction, 0 disables).
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Send periodic pings and watch for silence.
    pub enabled: bool,
    /// Ping interval.
    pub interval: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

/// Price processing settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSettings {
    /// Minimum move, in percent, reported as `price.change`.
    pub min_change_percent: f64,
    /// Minimum move, in percent, reported as `price.spike`.
    pub spike_threshold_percent: f64,
    /// Ticks retained per symbol.
    pub history_capacity: usize,
    /// Record tick history at all.
    pub history_enabled: bool,
}

impl Default for PriceSettings {
    fn default() -> Self {
        Self {
            min_change_percent: 0.1,
            spike_threshold_percent: 5.0,
            history_capacity: 1000,
            history_enabled: true,
        }
    }
}

impl From<&PriceSettings> for PriceStreamConfig {
    fn from(settings: &PriceSettings) -> Self {
        Self {
            min_change_percent: settings.min_change_percent,
            spike_threshold_percent: settings.spike_threshold_percent,
            history_capacity: settings.history_capacity,
            track_history: settings.history_enabled,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Feed WebSocket URL.
    pub endpoint: String,
    /// Wire protocol of the feed.
    pub provider: Provider,
    /// Provider credential.
    pub credentials: Credentials,
    /// Bound on transport plus protocol handshake.
    pub connect_timeout: Duration,
    /// Reconnection settings.
    pub reconnect: ReconnectSettings,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatSettings,
    /// Price processing settings.
    pub prices: PriceSettings,
    /// Symbols the service binary streams on startup.
    pub symbols: Vec<String>,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl StreamSettings {
    /// Settings with defaults for everything but the credential.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            provider: Provider::default(),
            credentials,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            prices: PriceSettings::default(),
            symbols: Vec::new(),
            metrics_port: 9090,
        }
    }

    /// Override the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Override the provider.
    #[must_use]
    pub const fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is missing or a value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let api_key = lookup("MARKET_STREAM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_STREAM_API_KEY".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_STREAM_API_KEY".to_string()));
        }

        let provider = match env.get("MARKET_STREAM_PROVIDER") {
            Some(name) => Provider::from_str_case_insensitive(&name).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "MARKET_STREAM_PROVIDER".to_string(),
                    reason: format!("unknown provider `{name}`"),
                }
            })?,
            None => Provider::default(),
        };

        let mut settings = Self::new(Credentials::new(api_key)).with_provider(provider);
        let reconnect_defaults = ReconnectSettings::default();
        let heartbeat_defaults = HeartbeatSettings::default();
        let price_defaults = PriceSettings::default();

        if let Some(endpoint) = env.get("MARKET_STREAM_ENDPOINT") {
            settings.endpoint = endpoint;
        }
        settings.connect_timeout =
            env.duration_secs("MARKET_STREAM_CONNECT_TIMEOUT_SECS", settings.connect_timeout);

        settings.reconnect = ReconnectSettings {
            enabled: env.bool("MARKET_STREAM_RECONNECT_ENABLED", reconnect_defaults.enabled),
            max_attempts: env.parse(
                "MARKET_STREAM_RECONNECT_MAX_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
            initial_delay: env.duration_millis(
                "MARKET_STREAM_RECONNECT_INITIAL_DELAY_MS",
                reconnect_defaults.initial_delay,
            ),
            max_delay: env.duration_millis(
                "MARKET_STREAM_RECONNECT_MAX_DELAY_MS",
                reconnect_defaults.max_delay,
            ),
            backoff_multiplier: env.parse(
                "MARKET_STREAM_RECONNECT_BACKOFF_MULTIPLIER",
                reconnect_defaults.backoff_multiplier,
            ),
            jitter: env.parse("MARKET_STREAM_RECONNECT_JITTER", reconnect_defaults.jitter),
        };

        settings.heartbeat = HeartbeatSettings {
            enabled: env.bool("MARKET_STREAM_HEARTBEAT_ENABLED", heartbeat_defaults.enabled),
            interval: env.duration_secs(
                "MARKET_STREAM_HEARTBEAT_INTERVAL_SECS",
                heartbeat_defaults.interval,
            ),
        };

        settings.prices = PriceSettings {
            min_change_percent: env.parse(
                "MARKET_STREAM_MIN_CHANGE_PERCENT",
                price_defaults.min_change_percent,
            ),
            spike_threshold_percent: env.parse(
                "MARKET_STREAM_SPIKE_THRESHOLD_PERCENT",
                price_defaults.spike_threshold_percent,
            ),
            history_capacity: env.parse(
                "MARKET_STREAM_HISTORY_CAPACITY",
                price_defaults.history_capacity,
            ),
            history_enabled: env.bool(
                "MARKET_STREAM_HISTORY_ENABLED",
                price_defaults.history_enabled,
            ),
        };

        settings.symbols = env
            .get("MARKET_STREAM_SYMBOLS")
            .map(|raw| parse_symbols(&raw))
            .unwrap_or_default();
        settings.metrics_port = env.parse("MARKET_STREAM_METRICS_PORT", settings.metrics_port);

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                reason: reason.into(),
            }
        }

        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(invalid(
                "MARKET_STREAM_ENDPOINT",
                "endpoint must be a ws:// or wss:// URL",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid(
                "MARKET_STREAM_CONNECT_TIMEOUT_SECS",
                "timeout must be positive",
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.enabled && reconnect.max_attempts == 0 {
            return Err(invalid(
                "MARKET_STREAM_RECONNECT_MAX_ATTEMPTS",
                "at least one attempt is required when reconnection is enabled",
            ));
        }
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(invalid(
                "MARKET_STREAM_RECONNECT_BACKOFF_MULTIPLIER",
                "multiplier must be at least 1.0",
            ));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(invalid(
                "MARKET_STREAM_RECONNECT_MAX_DELAY_MS",
                "max delay must not be below the initial delay",
            ));
        }
        if !(0.0..1.0).contains(&reconnect.jitter) {
            return Err(invalid(
                "MARKET_STREAM_RECONNECT_JITTER",
                "jitter must be in [0, 1)",
            ));
        }

        if self.heartbeat.enabled && self.heartbeat.interval.is_zero() {
            return Err(invalid(
                "MARKET_STREAM_HEARTBEAT_INTERVAL_SECS",
                "interval must be positive",
            ));
        }

        let prices = &self.prices;
        if !prices.min_change_percent.is_finite() || prices.min_change_percent < 0.0 {
            return Err(invalid(
                "MARKET_STREAM_MIN_CHANGE_PERCENT",
                "must be a non-negative number",
            ));
        }
        if !prices.spike_threshold_percent.is_finite() || prices.spike_threshold_percent < 0.0 {
            return Err(invalid(
                "MARKET_STREAM_SPIKE_THRESHOLD_PERCENT",
                "must be a non-negative number",
            ));
        }
        if prices.history_capacity == 0 {
            return Err(invalid(
                "MARKET_STREAM_HISTORY_CAPACITY",
                "capacity must be at least 1",
            ));
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_symbol)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Typed accessors over a key lookup. Unparseable values fall back to the
/// default.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map_or(default, |v| match v.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            })
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
