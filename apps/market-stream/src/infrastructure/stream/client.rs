//! Stream Client
//!
//! Owns the upstream connection: transport and protocol handshake,
//! subscription bookkeeping, the single-reader receive loop, heartbeat
//! supervision and reconnection with exponential backoff.
//!
//! # Concurrency
//!
//! [`StreamClient::listen`] is the only reader. It drains frames in wire
//! order and runs message callbacks inline before reading the next frame.
//! Writes from `subscribe`, `send`, pongs and heartbeat pings go through a
//! single mutex-guarded sink. `disconnect` cancels the lifecycle token,
//! which interrupts a pending read, a backoff delay or a handshake.
//!
//! # Reconnection
//!
//! On an unexpected close, a transport error or a heartbeat timeout the
//! loop tears the session down, reports the error once, and (if enabled)
//! walks the [`ReconnectPolicy`]: emit `Reconnecting`, wait, reconnect.
//! Success resubscribes every tracked symbol and resumes reading; when the
//! attempts run out the client stays disconnected until `connect` is called
//! again. A `listen` timeout that fires mid-cycle parks the cycle in the
//! `Reconnecting` state and the next `listen` call picks it up where it
//! stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FeedCodec, FeedMessage};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::websocket::redact_query;
pub use crate::application::ports::StreamStats;
use crate::application::ports::{
    Connection, Connector, FeedError, FrameSink, FrameSource, MarketFeed, TickCallback,
    TransportError, WireFrame,
};
use crate::domain::connection::{ConnectionEvent, ConnectionState};
use crate::domain::subscription::{SubscriptionSet, Symbol};
use crate::domain::tick::PriceTick;
use crate::infrastructure::config::{Credentials, StreamSettings};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Feed endpoint (`ws://` or `wss://`).
    pub endpoint: String,
    /// Provider credential.
    pub credentials: Credentials,
    /// Bound on transport plus protocol handshake.
    pub connect_timeout: Duration,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Heartbeat supervision; `None` disables it.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl StreamClientConfig {
    /// Configuration with default timeouts, reconnection and heartbeat.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            heartbeat: Some(HeartbeatConfig::default()),
        }
    }

    /// Build from service settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings) -> Self {
        let heartbeat = settings
            .heartbeat
            .enabled
            .then(|| HeartbeatConfig::with_interval(settings.heartbeat.interval));

        Self {
            endpoint: settings.endpoint.clone(),
            credentials: settings.credentials.clone(),
            connect_timeout: settings.connect_timeout,
            reconnect: ReconnectConfig::from(&settings.reconnect),
            heartbeat,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override reconnection behavior.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Override heartbeat supervision.
    #[must_use]
    pub const fn with_heartbeat(mut self, heartbeat: Option<HeartbeatConfig>) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Stream client errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Transport failure while connecting, reading or writing.
    #[error(transparent)]
    Connection(#[from] TransportError),

    /// Transport or protocol handshake did not finish in time.
    #[error("handshake with {endpoint} timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Endpoint with credentials stripped.
        endpoint: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// The provider rejected the credential.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation needs an open connection.
    #[error("not connected")]
    NotConnected,

    /// Another connect or a reconnection cycle is running.
    #[error("connection attempt already in progress")]
    ConnectInProgress,

    /// Nothing arrived from the feed for too long.
    #[error("no activity from feed for {0:?}")]
    HeartbeatTimeout(Duration),

    /// Every reconnection attempt failed.
    #[error("reconnection failed after {attempts} attempts")]
    ExhaustedRetries {
        /// Attempts made.
        attempts: u32,
    },

    /// A handshake frame could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// `disconnect` interrupted the operation.
    #[error("stream client shut down")]
    Shutdown,
}

/// Why [`StreamClient::listen`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The listen timeout elapsed; the connection is still open.
    TimedOut,
    /// `disconnect` was called.
    Stopped,
    /// The connection dropped and reconnection is disabled.
    ConnectionLost,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    frames_dropped: AtomicU64,
    ticks_received: AtomicU64,
    ticks_rejected: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnections: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Callbacks
// =============================================================================

type MessageCallback = Arc<dyn Fn(&PriceTick) + Send + Sync>;
type ConnectionCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&StreamError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    message: Vec<MessageCallback>,
    connection: Vec<ConnectionCallback>,
    error: Vec<ErrorCallback>,
}

/// Read half of an open session.
struct Session {
    source: Box<dyn FrameSource>,
    heartbeat_rx: Option<mpsc::Receiver<HeartbeatEvent>>,
}

enum Step {
    Stopped,
    TimedOut,
    Heartbeat(HeartbeatEvent),
    Frame(Option<Result<WireFrame, TransportError>>),
}

enum Recovery {
    Resumed(Session),
    Stopped,
    /// The listen deadline hit; the cycle is parked for the next `listen`.
    Paused,
}

/// Reconnection progress carried across `listen` calls.
struct RetryCycle {
    policy: ReconnectPolicy,
    /// When the announced attempt is due. `None` until the next delay is drawn.
    due: Option<Instant>,
}

// =============================================================================
// Stream Client
// =============================================================================

/// Market data stream client.
pub struct StreamClient {
    config: StreamClientConfig,
    codec: Arc<dyn FeedCodec>,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    subscriptions: Mutex<SubscriptionSet>,
    writer: AsyncMutex<Option<Box<dyn FrameSink>>>,
    reader: AsyncMutex<Option<Session>>,
    retry: Mutex<Option<RetryCycle>>,
    lifecycle: Mutex<CancellationToken>,
    session_cancel: Mutex<CancellationToken>,
    heartbeat: Arc<HeartbeatState>,
    connected_at: RwLock<Option<Instant>>,
    callbacks: RwLock<Callbacks>,
    counters: Counters,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &redact_query(&self.config.endpoint))
            .field("provider", &self.codec.name())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(
        config: StreamClientConfig,
        codec: Arc<dyn FeedCodec>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            codec,
            connector,
            state: RwLock::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            writer: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
            retry: Mutex::new(None),
            lifecycle: Mutex::new(CancellationToken::new()),
            session_cancel: Mutex::new(CancellationToken::new()),
            heartbeat: Arc::new(HeartbeatState::new()),
            connected_at: RwLock::new(None),
            callbacks: RwLock::new(Callbacks::default()),
            counters: Counters::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Callback registration
    // -------------------------------------------------------------------------

    /// Run `callback` for every valid tick, in receive order.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&PriceTick) + Send + Sync + 'static,
    {
        self.callbacks.write().message.push(Arc::new(callback));
    }

    /// Run `callback` on connection lifecycle changes.
    pub fn on_connection<F>(&self, callback: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().connection.push(Arc::new(callback));
    }

    /// Run `callback` when the connection fails.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.callbacks.write().error.push(Arc::new(callback));
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Tracked symbols, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.subscriptions.lock().to_vec()
    }

    /// Provider name of the codec in use.
    #[must_use]
    pub fn provider(&self) -> &'static str {
        self.codec.name()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let state = self.state();
        let connected = state.is_connected();
        let uptime_secs = self
            .connected_at
            .read()
            .map_or(0.0, |at| at.elapsed().as_secs_f64());
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        StreamStats {
            state,
            connected,
            uptime_secs,
            messages_received: load(&self.counters.messages_received),
            messages_sent: load(&self.counters.messages_sent),
            frames_dropped: load(&self.counters.frames_dropped),
            ticks_received: load(&self.counters.ticks_received),
            ticks_rejected: load(&self.counters.ticks_rejected),
            reconnect_attempts: load(&self.counters.reconnect_attempts),
            reconnections: load(&self.counters.reconnections),
            subscriptions: self.subscriptions(),
            secs_since_activity: connected
                .then(|| self.heartbeat.time_since_activity().as_secs_f64()),
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Connect, authenticate, start the heartbeat and resend every tracked
    /// subscription. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if a connect or reconnection cycle is already running,
    /// the transport or handshake fails or times out, the credential is
    /// rejected, or `disconnect` interrupts the attempt.
    pub async fn connect(&self) -> Result<(), StreamError> {
        {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(StreamError::ConnectInProgress);
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }
        metrics::set_connection_state(self.provider(), ConnectionState::Connecting);

        let lifecycle = self.fresh_lifecycle();
        let session = match self.establish(&lifecycle).await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(error = %error, "Failed to connect to feed");
                self.set_state(ConnectionState::Disconnected);
                return Err(error);
            }
        };

        *self.reader.lock().await = Some(session);
        if lifecycle.is_cancelled() {
            self.teardown().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(StreamError::Shutdown);
        }

        self.mark_connected().await;
        Ok(())
    }

    /// Close the connection and cancel any pending reconnection. The client
    /// stays disconnected until `connect` is called again. Calling it again
    /// is a no-op.
    pub async fn disconnect(&self) {
        self.lifecycle.lock().cancel();
        self.retry.lock().take();
        let previous = std::mem::replace(&mut *self.state.write(), ConnectionState::Disconnected);
        metrics::set_connection_state(self.provider(), ConnectionState::Disconnected);

        self.teardown().await;
        // A running listen owns the reader and drops the session itself.
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = None;
        }

        if previous == ConnectionState::Disconnected {
            return;
        }

        *self.connected_at.write() = None;
        tracing::info!(provider = self.provider(), "Disconnected from feed");
        self.emit_connection(&ConnectionEvent::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Subscriptions and writes
    // -------------------------------------------------------------------------

    /// Track `symbols`. Newly added symbols are sent right away when
    /// connected and replayed on the next connect otherwise.
    ///
    /// Returns the symbols that were not already tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the subscribe frame fails.
    pub async fn subscribe<I, S>(&self, symbols: I) -> Result<Vec<Symbol>, StreamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added = self.subscriptions.lock().add(symbols);
        let frames = self.codec.subscribe_frames(&added);
        self.send_control(frames, "subscribe", &added).await?;
        Ok(added)
    }

    /// Stop tracking `symbols`. Removed symbols are unsubscribed right away
    /// when connected.
    ///
    /// Returns the symbols that were tracked before the call.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the unsubscribe frame fails.
    pub async fn unsubscribe<I, S>(&self, symbols: I) -> Result<Vec<Symbol>, StreamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = self.subscriptions.lock().remove(symbols);
        let frames = self.codec.unsubscribe_frames(&removed);
        self.send_control(frames, "unsubscribe", &removed).await?;
        Ok(removed)
    }

    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotConnected`] without an open connection, or
    /// the transport error if the write fails.
    pub async fn send(&self, frame: WireFrame) -> Result<(), StreamError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(StreamError::NotConnected)?;
        sink.send(frame).await?;
        drop(writer);

        Counters::bump(&self.counters.messages_sent);
        metrics::record_frame_sent(self.provider());
        Ok(())
    }

    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// See [`StreamClient::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), StreamError> {
        self.send(WireFrame::Text(text.into())).await
    }

    async fn send_control(
        &self,
        frames: Vec<String>,
        action: &'static str,
        symbols: &[Symbol],
    ) -> Result<(), StreamError> {
        if symbols.is_empty() {
            return Ok(());
        }
        if !self.is_connected() {
            tracing::debug!(action, ?symbols, "Not connected, deferring until connect");
            return Ok(());
        }

        for frame in frames {
            match self.send_text(frame).await {
                Ok(()) => {}
                // Lost the connection in between; the set is replayed on connect.
                Err(StreamError::NotConnected) => return Ok(()),
                Err(error) => return Err(error),
            }
        }
        tracing::info!(action, ?symbols, "Subscription change sent");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Receive loop
    // -------------------------------------------------------------------------

    /// Read frames and run message callbacks until `disconnect`, the
    /// optional `timeout`, or a connection loss that cannot be recovered.
    ///
    /// The timeout bounds the whole call, backoff delays and reconnection
    /// handshakes included. When it fires mid-cycle the client stays
    /// `Reconnecting` and the next call continues the same cycle.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotConnected`] when called without an open
    /// connection and [`StreamError::ExhaustedRetries`] when every
    /// reconnection attempt failed.
    pub async fn listen(&self, timeout: Option<Duration>) -> Result<ListenOutcome, StreamError> {
        let mut reader = self.reader.lock().await;
        let lifecycle = self.lifecycle.lock().clone();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if reader.is_none() {
                let Some(cycle) = self.retry.lock().take() else {
                    return Err(StreamError::NotConnected);
                };
                match self.run_retry_cycle(cycle, &lifecycle, deadline).await? {
                    Recovery::Resumed(session) => {
                        if lifecycle.is_cancelled() {
                            self.teardown().await;
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(ListenOutcome::Stopped);
                        }
                        *reader = Some(session);
                        self.mark_connected().await;
                    }
                    Recovery::Stopped => {
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(ListenOutcome::Stopped);
                    }
                    Recovery::Paused => return Ok(ListenOutcome::TimedOut),
                }
            }
            let Some(session) = reader.as_mut() else {
                return Err(StreamError::NotConnected);
            };

            let step = tokio::select! {
                biased;
                () = lifecycle.cancelled() => Step::Stopped,
                () = sleep_until(deadline) => Step::TimedOut,
                Some(event) = next_heartbeat(&mut session.heartbeat_rx) => Step::Heartbeat(event),
                frame = session.source.next_frame() => Step::Frame(frame),
            };

            let loss = match step {
                Step::Stopped => {
                    *reader = None;
                    return Ok(ListenOutcome::Stopped);
                }
                Step::TimedOut => return Ok(ListenOutcome::TimedOut),
                Step::Heartbeat(HeartbeatEvent::SendPing) => {
                    tracing::trace!("Sending heartbeat ping");
                    self.send(WireFrame::Ping(Vec::new())).await.err()
                }
                Step::Heartbeat(HeartbeatEvent::Timeout(idle)) => {
                    Some(StreamError::HeartbeatTimeout(idle))
                }
                Step::Frame(Some(Ok(frame))) => self.handle_frame(frame).await,
                Step::Frame(Some(Err(error))) => Some(error.into()),
                Step::Frame(None) => Some(TransportError::Closed.into()),
            };

            let Some(cause) = loss else {
                continue;
            };

            *reader = None;
            if !self.connection_lost(cause).await {
                return Ok(ListenOutcome::ConnectionLost);
            }
        }
    }

    /// Returns the connection-loss cause, if the frame ended the session.
    async fn handle_frame(&self, frame: WireFrame) -> Option<StreamError> {
        self.heartbeat.record_activity();
        Counters::bump(&self.counters.messages_received);
        metrics::record_frame_received(self.provider());

        match frame {
            WireFrame::Text(text) => self.handle_text(&text),
            WireFrame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => self.handle_text(&text),
                Err(_) => self.drop_frame(&"binary frame is not UTF-8"),
            },
            WireFrame::Ping(data) => {
                if let Err(error) = self.send(WireFrame::Pong(data)).await {
                    return Some(error);
                }
            }
            WireFrame::Pong(_) => tracing::trace!("Heartbeat pong received"),
            WireFrame::Close => {
                tracing::info!(provider = self.provider(), "Feed sent close frame");
                return Some(TransportError::Closed.into());
            }
        }
        None
    }

    fn handle_text(&self, text: &str) {
        let messages = match self.codec.decode(text) {
            Ok(messages) => messages,
            Err(error) => {
                self.drop_frame(&error);
                return;
            }
        };

        for message in messages {
            match message {
                FeedMessage::Tick(tick) => {
                    Counters::bump(&self.counters.ticks_received);
                    self.emit_message(&tick);
                }
                FeedMessage::Rejected(error) => {
                    Counters::bump(&self.counters.ticks_rejected);
                    metrics::record_tick_rejected(self.provider());
                    tracing::debug!(error = %error, "Discarding invalid tick");
                }
                FeedMessage::ProviderError(detail) => {
                    tracing::warn!(provider = self.provider(), %detail, "Feed reported an error");
                }
                FeedMessage::AuthFailed(detail) => {
                    tracing::warn!(provider = self.provider(), %detail, "Unexpected auth failure");
                }
                FeedMessage::SubscriptionAck(detail) => {
                    tracing::debug!(%detail, "Subscription acknowledged");
                }
                FeedMessage::Keepalive | FeedMessage::Connected | FeedMessage::Authenticated => {
                    tracing::trace!(kind = ?message, "Control message");
                }
            }
        }
    }

    fn drop_frame(&self, reason: &dyn std::fmt::Display) {
        Counters::bump(&self.counters.frames_dropped);
        metrics::record_frame_dropped(self.provider());
        tracing::warn!(provider = self.provider(), error = %reason, "Dropping malformed frame");
    }

    // -------------------------------------------------------------------------
    // Session management
    // -------------------------------------------------------------------------

    fn fresh_lifecycle(&self) -> CancellationToken {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_cancelled() {
            *lifecycle = CancellationToken::new();
        }
        lifecycle.clone()
    }

    fn dial_url(&self) -> String {
        self.codec
            .endpoint_url(&self.config.endpoint, self.config.credentials.api_key())
    }

    /// Handshake, then install the write half and start the heartbeat.
    async fn establish(&self, lifecycle: &CancellationToken) -> Result<Session, StreamError> {
        let url = self.dial_url();
        let endpoint = redact_query(&url);
        let timeout = self.config.connect_timeout;
        tracing::info!(%endpoint, provider = self.provider(), "Connecting to feed");

        let (sink, source) = tokio::select! {
            biased;
            () = lifecycle.cancelled() => return Err(StreamError::Shutdown),
            result = tokio::time::timeout(timeout, self.handshake(&url)) => {
                result.map_err(|_| StreamError::HandshakeTimeout { endpoint, timeout })??
            }
        };

        Ok(self.activate(sink, source, lifecycle).await)
    }

    async fn handshake(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), StreamError> {
        let Connection {
            mut sink,
            mut source,
        } = self.connector.connect(url).await?;

        let Some(auth) = self.codec.auth_frame(self.config.credentials.api_key()) else {
            return Ok((sink, source));
        };
        sink.send(WireFrame::Text(auth)).await?;
        Counters::bump(&self.counters.messages_sent);

        loop {
            let frame = match source.next_frame().await {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => return Err(error.into()),
                None => return Err(TransportError::Closed.into()),
            };
            Counters::bump(&self.counters.messages_received);

            match frame {
                WireFrame::Text(text) => {
                    for message in self.codec.decode(&text)? {
                        match message {
                            FeedMessage::Authenticated => {
                                tracing::info!(provider = self.provider(), "Authenticated");
                                return Ok((sink, source));
                            }
                            FeedMessage::AuthFailed(reason) => {
                                return Err(StreamError::AuthenticationFailed(reason));
                            }
                            other => tracing::debug!(kind = ?other, "Ignored during handshake"),
                        }
                    }
                }
                WireFrame::Ping(data) => sink.send(WireFrame::Pong(data)).await?,
                WireFrame::Close => return Err(TransportError::Closed.into()),
                WireFrame::Binary(_) | WireFrame::Pong(_) => {}
            }
        }
    }

    async fn activate(
        &self,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        lifecycle: &CancellationToken,
    ) -> Session {
        *self.writer.lock().await = Some(sink);
        self.heartbeat.reset();

        let session_cancel = lifecycle.child_token();
        let previous = std::mem::replace(&mut *self.session_cancel.lock(), session_cancel.clone());
        previous.cancel();

        let heartbeat_rx = self.config.heartbeat.map(|config| {
            let (event_tx, event_rx) = mpsc::channel(8);
            let manager = HeartbeatManager::new(
                config,
                Arc::clone(&self.heartbeat),
                event_tx,
                session_cancel,
            );
            tokio::spawn(manager.run());
            event_rx
        });

        Session {
            source,
            heartbeat_rx,
        }
    }

    async fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected);
        *self.connected_at.write() = Some(Instant::now());

        let endpoint = redact_query(&self.dial_url());
        tracing::info!(%endpoint, provider = self.provider(), "Connected to feed");
        self.emit_connection(&ConnectionEvent::Connected { endpoint });

        let symbols = self.subscriptions();
        if symbols.is_empty() {
            return;
        }
        let frames = self.codec.subscribe_frames(&symbols);
        if let Err(error) = self.send_control(frames, "resubscribe", &symbols).await {
            tracing::warn!(error = %error, "Failed to restore subscriptions");
        }
    }

    /// Stop the heartbeat and close the write half.
    async fn teardown(&self) {
        self.session_cancel.lock().cancel();
        *self.connected_at.write() = None;

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(error) = sink.close().await
        {
            tracing::debug!(error = %error, "Close handshake failed");
        }
    }

    /// Tear the session down and report `cause`. Returns `false` when
    /// reconnection is disabled; otherwise parks a fresh retry cycle.
    async fn connection_lost(&self, cause: StreamError) -> bool {
        tracing::warn!(provider = self.provider(), error = %cause, "Connection lost");
        self.teardown().await;
        self.emit_error(&cause);

        if !self.config.reconnect.enabled {
            self.set_state(ConnectionState::Disconnected);
            self.emit_connection(&ConnectionEvent::Disconnected);
            return false;
        }

        self.set_state(ConnectionState::Reconnecting);
        *self.retry.lock() = Some(RetryCycle {
            policy: ReconnectPolicy::new(self.config.reconnect.clone()),
            due: None,
        });
        true
    }

    /// Walk the backoff schedule until a session is up, `disconnect` is
    /// called, `deadline` passes or the attempts run out.
    async fn run_retry_cycle(
        &self,
        mut cycle: RetryCycle,
        lifecycle: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Recovery, StreamError> {
        loop {
            let due = match cycle.due {
                Some(due) => due,
                None => {
                    let Some(delay) = cycle.policy.next_delay() else {
                        break;
                    };
                    let attempt = cycle.policy.attempt_count();
                    Counters::bump(&self.counters.reconnect_attempts);
                    metrics::record_reconnect_attempt(self.provider());
                    tracing::info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to feed"
                    );
                    self.emit_connection(&ConnectionEvent::Reconnecting { attempt, delay });
                    *cycle.due.insert(Instant::now() + delay)
                }
            };

            tokio::select! {
                biased;
                () = lifecycle.cancelled() => {
                    tracing::info!("Reconnection cancelled");
                    return Ok(Recovery::Stopped);
                }
                () = sleep_until(deadline) => {
                    *self.retry.lock() = Some(cycle);
                    return Ok(Recovery::Paused);
                }
                () = tokio::time::sleep_until(due) => {}
            }

            cycle.due = None;
            let attempt = cycle.policy.attempt_count();
            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                biased;
                () = sleep_until(deadline) => None,
                result = self.establish(lifecycle) => Some(result),
            };

            match result {
                None => {
                    tracing::debug!(attempt, "Listen timeout interrupted reconnection attempt");
                    self.set_state(ConnectionState::Reconnecting);
                    *self.retry.lock() = Some(cycle);
                    return Ok(Recovery::Paused);
                }
                Some(Ok(session)) => {
                    Counters::bump(&self.counters.reconnections);
                    return Ok(Recovery::Resumed(session));
                }
                Some(Err(StreamError::Shutdown)) => return Ok(Recovery::Stopped),
                Some(Err(error)) => {
                    tracing::warn!(attempt, error = %error, "Reconnection attempt failed");
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
        }

        let attempts = cycle.policy.attempt_count();
        tracing::error!(attempts, "Reconnection attempts exhausted");
        self.set_state(ConnectionState::Disconnected);
        self.emit_connection(&ConnectionEvent::RetriesExhausted { attempts });

        let error = StreamError::ExhaustedRetries { attempts };
        self.emit_error(&error);
        Err(error)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        metrics::set_connection_state(self.provider(), state);
        tracing::trace!(%state, "Connection state changed");
    }

    // -------------------------------------------------------------------------
    // Callback fan-out (callbacks run without any client lock held)
    // -------------------------------------------------------------------------

    fn emit_message(&self, tick: &PriceTick) {
        let callbacks = self.callbacks.read().message.clone();
        for callback in callbacks {
            callback(tick);
        }
    }

    fn emit_connection(&self, event: &ConnectionEvent) {
        let callbacks = self.callbacks.read().connection.clone();
        for callback in callbacks {
            callback(event);
        }
    }

    fn emit_error(&self, error: &StreamError) {
        let callbacks = self.callbacks.read().error.clone();
        for callback in callbacks {
            callback(error);
        }
    }
}

#[async_trait]
impl MarketFeed for StreamClient {
    async fn subscribe(&self, symbols: &[Symbol]) -> Result<Vec<Symbol>, FeedError> {
        Self::subscribe(self, symbols)
            .await
            .map_err(|e| FeedError::new("subscribe", e))
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<Vec<Symbol>, FeedError> {
        Self::unsubscribe(self, symbols)
            .await
            .map_err(|e| FeedError::new("unsubscribe", e))
    }

    fn on_tick(&self, callback: TickCallback) {
        self.on_message(callback);
    }

    fn stats(&self) -> StreamStats {
        Self::stats(self)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_heartbeat(rx: &mut Option<mpsc::Receiver<HeartbeatEvent>>) -> Option<HeartbeatEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
