//! Heartbeat Manager
//!
//! Periodically asks the reader to ping the feed and declares the
//! connection dead once nothing (data, pong, or keepalive) has arrived for
//! longer than the timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Ping cadence for the heartbeat task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping requests.
    pub interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::with_interval(Duration::from_secs(30))
    }
}

impl HeartbeatConfig {
    /// Ping every `interval`; time out after twice that without activity.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            timeout: interval * 2,
        }
    }
}

/// Requests from the heartbeat task to the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping on the connection.
    SendPing,
    /// No activity within the timeout; the manager has stopped.
    Timeout(Duration),
}

/// Last-activity clock shared between the reader and the manager.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Start the clock now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record that something arrived from the feed.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Restart the clock for a new connection.
    pub fn reset(&self) {
        self.record_activity();
    }
}

/// Sends pings on a fixed cadence and reports a silent feed.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Manager for one session; stops when `cancel` fires.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout fires.
    pub async fn run(self) {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat stopped with its session");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_ping().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the loop should exit.
    async fn check_and_ping(&self) -> bool {
        let idle = self.state.time_since_activity();
        if idle > self.config.timeout {
            tracing::warn!(
                idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout(idle)).await;
            return false;
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Reader loop gone, stopping heartbeat");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(
        interval: Duration,
        state: Arc<HeartbeatState>,
    ) -> (
        mpsc::Receiver<HeartbeatEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(
            HeartbeatConfig::with_interval(interval),
            state,
            event_tx,
            cancel.clone(),
        );
        (event_rx, cancel, tokio::spawn(manager.run()))
    }

    #[test]
    fn timeout_is_twice_the_interval() {
        let config = HeartbeatConfig::with_interval(Duration::from_secs(15));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(HeartbeatConfig::default().interval, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval_while_active() {
        let state = Arc::new(HeartbeatState::new());
        let (mut rx, cancel, handle) = spawn(Duration::from_secs(10), Arc::clone(&state));

        for _ in 0..4 {
            assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
            state.record_activity();
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_beyond_twice_interval_times_out() {
        let state = Arc::new(HeartbeatState::new());
        let started = Instant::now();
        let (mut rx, _cancel, handle) = spawn(Duration::from_secs(10), state);

        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));

        let event = rx.recv().await;
        assert!(matches!(event, Some(HeartbeatEvent::Timeout(idle)) if idle > Duration::from_secs(20)));
        assert!(started.elapsed() >= Duration::from_secs(30));

        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_manager() {
        let state = Arc::new(HeartbeatState::new());
        let (_rx, cancel, handle) = spawn(Duration::from_secs(10), state);

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_clock() {
        let state = HeartbeatState::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(state.time_since_activity() >= Duration::from_secs(5));

        state.reset();
        assert_eq!(state.time_since_activity(), Duration::ZERO);
    }
}
