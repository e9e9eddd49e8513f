//! Market Stream Binary
//!
//! Connects to the configured feed, streams the configured symbols, and
//! logs every price event until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_STREAM_API_KEY`: Provider API key
//!
//! ## Optional
//! - `MARKET_STREAM_PROVIDER`: polygon | finnhub (default: polygon)
//! - `MARKET_STREAM_ENDPOINT`: Feed WebSocket URL
//! - `MARKET_STREAM_SYMBOLS`: Comma-separated symbols to stream on startup
//! - `MARKET_STREAM_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 9090)
//! - `MARKET_STREAM_RECONNECT_*`, `MARKET_STREAM_HEARTBEAT_*`: Connection tuning
//! - `MARKET_STREAM_MIN_CHANGE_PERCENT`, `MARKET_STREAM_SPIKE_THRESHOLD_PERCENT`,
//!   `MARKET_STREAM_HISTORY_*`: Price processing
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream)
//! - `RUST_LOG`: Log filter (default: market_stream=info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream::application::services::{
    Event, EventBus, ListenerOptions, PriceEvent, PriceStream, PriceStreamConfig, WILDCARD,
};
use market_stream::infrastructure::metrics;
use market_stream::infrastructure::stream::{
    ListenOutcome, StreamClient, StreamClientConfig, WebSocketConnector, codec_for,
};
use market_stream::infrastructure::telemetry;
use market_stream::{ConnectionEvent, StreamSettings};
use tokio::signal;

/// Bound on unsubscribing and closing the connection at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lowest priority, so the logging listener sees events after everyone else.
const LOGGING_PRIORITY: i32 = i32::MIN;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider is already installed"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting market stream");

    let settings = StreamSettings::from_env()?;
    log_config(&settings);

    if settings.metrics_port != 0 {
        metrics::init_metrics(SocketAddr::from(([0, 0, 0, 0], settings.metrics_port)))?;
    }

    let client = Arc::new(StreamClient::new(
        StreamClientConfig::from_settings(&settings),
        codec_for(settings.provider),
        Arc::new(WebSocketConnector::new()),
    ));
    client.on_connection(|event| match event {
        ConnectionEvent::Reconnecting { attempt, delay } => {
            tracing::info!(attempt, ?delay, "Feed reconnecting");
        }
        ConnectionEvent::RetriesExhausted { attempts } => {
            tracing::error!(attempts, "Feed reconnection gave up");
        }
        ConnectionEvent::Connected { .. } | ConnectionEvent::Disconnected => {}
    });
    client.on_error(|error| tracing::warn!(error = %error, "Feed connection lost"));

    let bus = Arc::new(EventBus::<PriceEvent>::new());
    register_event_logging(&bus);

    let prices = PriceStream::new(
        client.clone(),
        bus,
        PriceStreamConfig::from(&settings.prices),
    );

    client.connect().await.context("initial feed connection failed")?;
    prices.start(&settings.symbols).await?;

    tracing::info!(symbols = settings.symbols.len(), "Market stream ready");

    let outcome = tokio::select! {
        () = await_shutdown() => None,
        result = client.listen(None) => Some(result),
    };

    shutdown(&prices, &client).await;
    tracing::info!(stats = ?prices.stats(), "Market stream stopped");

    match outcome {
        None | Some(Ok(ListenOutcome::Stopped | ListenOutcome::TimedOut)) => Ok(()),
        Some(Ok(ListenOutcome::ConnectionLost)) => {
            anyhow::bail!("feed connection lost and reconnection is disabled")
        }
        Some(Err(error)) => Err(error.into()),
    }
}

/// Log every price event and count it for Prometheus.
fn register_event_logging(bus: &EventBus<PriceEvent>) {
    bus.on(
        WILDCARD,
        ListenerOptions::priority(LOGGING_PRIORITY),
        |event: &Event<PriceEvent>| {
            metrics::record_event_dispatched(&event.name);
            let tick = event.payload.tick();
            match &event.payload {
                PriceEvent::Alert(alert) => {
                    metrics::record_alert_triggered(&tick.symbol);
                    tracing::warn!(
                        symbol = %tick.symbol,
                        price = %tick.price,
                        reasons = ?alert.reasons,
                        "Price alert"
                    );
                }
                PriceEvent::Update(update) => {
                    tracing::debug!(
                        symbol = %tick.symbol,
                        price = %tick.price,
                        change = ?update.change,
                        "Price update"
                    );
                }
                PriceEvent::Change(update) | PriceEvent::Spike(update) => {
                    tracing::info!(
                        event = %event.name,
                        symbol = %tick.symbol,
                        price = %tick.price,
                        change_percent = ?update.change_percent,
                        "Price moved"
                    );
                }
            }
            Ok(())
        },
    );
}

async fn shutdown(prices: &PriceStream, client: &StreamClient) {
    let graceful = async {
        if let Err(e) = prices.stop().await {
            tracing::warn!(error = %e, "Failed to unsubscribe on shutdown");
        }
        client.disconnect().await;
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, graceful).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }
}

/// Log the parsed configuration.
fn log_config(settings: &StreamSettings) {
    tracing::info!(
        provider = settings.provider.as_str(),
        symbols = ?settings.symbols,
        reconnect = settings.reconnect.enabled,
        heartbeat = settings.heartbeat.enabled,
        metrics_port = settings.metrics_port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
