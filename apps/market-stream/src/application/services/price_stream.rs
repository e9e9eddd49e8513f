//! Price Stream Service
//!
//! Turns raw ticks from a [`MarketFeed`] into price events on the
//! [`EventBus`]:
//!
//! | Event | When |
//! |---|---|
//! | `price.update` | every tick |
//! | `price.change` | `|change %| >= min_change_percent` |
//! | `price.spike` | `|change %| >= spike_threshold_percent` |
//! | `price.alert` | the symbol's alert rule matched |
//!
//! The first tick of a symbol has no baseline and only produces
//! `price.update` (plus an alert if a price threshold matches).
//!
//! State (last prices, history, alert rules, counters) lives behind a
//! single lock that is released before dispatch, so listeners may call the
//! read-only getters.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;

use super::event_bus::EventBus;
use crate::application::ports::{
    FeedError, HistoricalDataError, HistoricalDataPort, MarketFeed, StreamStats,
};
use crate::domain::alert::{AlertConditions, AlertReason, AlertRule};
use crate::domain::history::HistoryBuffer;
use crate::domain::subscription::{Symbol, normalize_symbol};
use crate::domain::tick::{PriceChange, PriceTick};

/// Dispatched for every tick.
pub const PRICE_UPDATE: &str = "price.update";
/// Dispatched when a move reaches `min_change_percent`.
pub const PRICE_CHANGE: &str = "price.change";
/// Dispatched when a move reaches `spike_threshold_percent`.
pub const PRICE_SPIKE: &str = "price.spike";
/// Dispatched when an alert rule fires.
pub const PRICE_ALERT: &str = "price.alert";

// =============================================================================
// Events
// =============================================================================

/// A tick together with its movement against the previous price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// The tick.
    pub tick: PriceTick,
    /// Previous price of the symbol, `None` on the first observation.
    pub previous_price: Option<Decimal>,
    /// Absolute change against the previous price.
    pub change: Option<Decimal>,
    /// Change in percent of the previous price.
    pub change_percent: Option<f64>,
}

/// A fired alert rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceAlert {
    /// Tick that fired the rule.
    pub tick: PriceTick,
    /// Every condition that matched.
    pub reasons: Vec<AlertReason>,
    /// The rule's conditions.
    pub conditions: AlertConditions,
    /// Move that was evaluated, if there was a previous price.
    pub change_percent: Option<f64>,
}

/// Payload of every price event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriceEvent {
    /// `price.update`
    Update(PriceUpdate),
    /// `price.change`
    Change(PriceUpdate),
    /// `price.spike`
    Spike(PriceUpdate),
    /// `price.alert`
    Alert(PriceAlert),
}

impl PriceEvent {
    /// Event name used on the bus.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Update(_) => PRICE_UPDATE,
            Self::Change(_) => PRICE_CHANGE,
            Self::Spike(_) => PRICE_SPIKE,
            Self::Alert(_) => PRICE_ALERT,
        }
    }

    /// The tick behind the event.
    #[must_use]
    pub const fn tick(&self) -> &PriceTick {
        match self {
            Self::Update(update) | Self::Change(update) | Self::Spike(update) => &update.tick,
            Self::Alert(alert) => &alert.tick,
        }
    }
}

// =============================================================================
// Configuration, Errors, Stats
// =============================================================================

/// Price stream configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceStreamConfig {
    /// Minimum move, in percent, reported as `price.change`.
    pub min_change_percent: f64,
    /// Minimum move, in percent, reported as `price.spike`.
    pub spike_threshold_percent: f64,
    /// Ticks kept per symbol.
    pub history_capacity: usize,
    /// Record tick history at all.
    pub track_history: bool,
}

impl Default for PriceStreamConfig {
    fn default() -> Self {
        Self {
            min_change_percent: 0.1,
            spike_threshold_percent: 5.0,
            history_capacity: 1000,
            track_history: true,
        }
    }
}

/// Price stream errors.
#[derive(Debug, thiserror::Error)]
pub enum PriceStreamError {
    /// The feed could not apply a subscription change.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Seeding history failed.
    #[error(transparent)]
    History(#[from] HistoricalDataError),
}

/// Snapshot of price stream statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PriceStreamStats {
    /// Whether ticks are being processed.
    pub running: bool,
    /// Seconds since `start` (0 when stopped).
    pub uptime_secs: f64,
    /// Ticks processed in this run.
    pub updates_received: u64,
    /// `price.change` events in this run.
    pub changes_detected: u64,
    /// `price.spike` events in this run.
    pub spikes_detected: u64,
    /// `price.alert` events in this run.
    pub alerts_triggered: u64,
    /// Symbols with a known last price.
    pub symbols_tracked: usize,
    /// Alert rules in place.
    pub alerts_active: usize,
    /// `updates_received / uptime_secs`, 0 when uptime is 0.
    pub updates_per_second: f64,
    /// Feed connection statistics.
    pub stream: StreamStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    updates_received: u64,
    changes_detected: u64,
    spikes_detected: u64,
    alerts_triggered: u64,
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    started_at: Option<Instant>,
    symbols: BTreeSet<Symbol>,
    last_prices: BTreeMap<Symbol, Decimal>,
    history: HashMap<Symbol, HistoryBuffer>,
    alerts: HashMap<Symbol, AlertRule>,
    counters: RunCounters,
}

// =============================================================================
// Price Stream
// =============================================================================

/// Price event producer.
pub struct PriceStream {
    feed: Arc<dyn MarketFeed>,
    bus: Arc<EventBus<PriceEvent>>,
    config: PriceStreamConfig,
    state: Mutex<State>,
}

impl std::fmt::Debug for PriceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceStream")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PriceStream {
    /// Create a stopped price stream and register it with `feed`.
    ///
    /// The feed only holds a weak reference, so dropping the last `Arc`
    /// detaches the stream.
    #[must_use]
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        bus: Arc<EventBus<PriceEvent>>,
        config: PriceStreamConfig,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            feed,
            bus,
            config,
            state: Mutex::new(State::default()),
        });

        let weak: Weak<Self> = Arc::downgrade(&stream);
        stream.feed.on_tick(Box::new(move |tick| {
            if let Some(stream) = weak.upgrade() {
                stream.handle_tick(tick);
            }
        }));

        stream
    }

    /// The event bus price events go to.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus<PriceEvent>> {
        &self.bus
    }

    /// Subscribe `symbols` and start processing ticks.
    ///
    /// Run counters reset only when the stream was stopped; starting again
    /// while running just adds symbols.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed fails to send the subscription. The
    /// symbols stay tracked by the feed and are replayed on reconnect.
    pub async fn start<I, S>(&self, symbols: I) -> Result<(), PriceStreamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols: Vec<Symbol> = symbols
            .into_iter()
            .map(|symbol| normalize_symbol(symbol.as_ref()))
            .filter(|symbol| !symbol.is_empty())
            .collect();

        {
            let mut state = self.state.lock();
            if !state.running {
                state.running = true;
                state.started_at = Some(Instant::now());
                state.counters = RunCounters::default();
            }
            state.symbols.extend(symbols.iter().cloned());
        }

        self.feed.subscribe(&symbols).await?;
        tracing::info!(?symbols, "Price stream started");
        Ok(())
    }

    /// Unsubscribe every tracked symbol and stop processing ticks.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed fails to send the unsubscription.
    pub async fn stop(&self) -> Result<(), PriceStreamError> {
        let symbols: Vec<Symbol> = {
            let mut state = self.state.lock();
            state.running = false;
            state.started_at = None;
            std::mem::take(&mut state.symbols).into_iter().collect()
        };

        if symbols.is_empty() {
            return Ok(());
        }

        self.feed.unsubscribe(&symbols).await?;
        tracing::info!(?symbols, "Price stream stopped");
        Ok(())
    }

    /// Whether ticks are being processed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    // -------------------------------------------------------------------------
    // Tick processing
    // -------------------------------------------------------------------------

    fn handle_tick(&self, tick: &PriceTick) {
        let events = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            self.apply_tick(&mut state, tick)
        };

        for event in events {
            self.bus.dispatch(event.name(), event);
        }
    }

    /// Update state for `tick` and return the events to dispatch, in order.
    fn apply_tick(&self, state: &mut State, tick: &PriceTick) -> Vec<PriceEvent> {
        let symbol = normalize_symbol(&tick.symbol);
        let previous = state.last_prices.insert(symbol.clone(), tick.price);
        state.counters.updates_received += 1;

        if self.config.track_history {
            state
                .history
                .entry(symbol.clone())
                .or_insert_with(|| HistoryBuffer::new(self.config.history_capacity))
                .push(tick.clone());
        }

        let movement = previous.map(|previous| PriceChange::between(previous, tick.price));
        let update = PriceUpdate {
            tick: tick.clone(),
            previous_price: previous,
            change: movement.map(|m| m.change),
            change_percent: movement.map(|m| m.percent),
        };

        let mut events = Vec::with_capacity(2);
        if let Some(movement) = movement {
            let magnitude = movement.percent.abs();
            if magnitude >= self.config.min_change_percent {
                state.counters.changes_detected += 1;
                events.push(PriceEvent::Change(update.clone()));
            }
            if magnitude >= self.config.spike_threshold_percent {
                state.counters.spikes_detected += 1;
                tracing::info!(
                    %symbol,
                    change_percent = movement.percent,
                    "Price spike"
                );
                events.push(PriceEvent::Spike(update.clone()));
            }
        }
        let change_percent = update.change_percent;
        events.insert(0, PriceEvent::Update(update));

        let fired = state.alerts.get(&symbol).and_then(|rule| {
            let reasons = rule.evaluate(tick.price, change_percent);
            (!reasons.is_empty()).then(|| (reasons, rule.conditions.clone()))
        });

        if let Some((reasons, conditions)) = fired {
            if conditions.once {
                state.alerts.remove(&symbol);
            }
            state.counters.alerts_triggered += 1;
            tracing::info!(%symbol, price = %tick.price, ?reasons, "Price alert");
            events.push(PriceEvent::Alert(PriceAlert {
                tick: tick.clone(),
                reasons,
                conditions,
                change_percent,
            }));
        }

        events
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Install the alert rule for `symbol`, replacing any existing one.
    ///
    /// Returns the replaced rule.
    pub fn set_alert(&self, symbol: &str, conditions: AlertConditions) -> Option<AlertRule> {
        let symbol = normalize_symbol(symbol);
        if !conditions.has_conditions() {
            tracing::warn!(%symbol, "Alert rule has no conditions and will never fire");
        }
        let rule = AlertRule::new(symbol.clone(), conditions);
        self.state.lock().alerts.insert(symbol, rule)
    }

    /// Remove the rule for `symbol`, or every rule when `None`.
    ///
    /// Returns the number of rules removed.
    pub fn clear_alerts(&self, symbol: Option<&str>) -> usize {
        let mut state = self.state.lock();
        match symbol {
            Some(symbol) => usize::from(state.alerts.remove(&normalize_symbol(symbol)).is_some()),
            None => {
                let removed = state.alerts.len();
                state.alerts.clear();
                removed
            }
        }
    }

    /// Active alert rules, sorted by symbol.
    #[must_use]
    pub fn alerts(&self) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self.state.lock().alerts.values().cloned().collect();
        rules.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        rules
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Up to `limit` most recent ticks of `symbol`, oldest first.
    #[must_use]
    pub fn get_history(&self, symbol: &str, limit: usize) -> Vec<PriceTick> {
        self.state
            .lock()
            .history
            .get(&normalize_symbol(symbol))
            .map(|buffer| buffer.latest(limit))
            .unwrap_or_default()
    }

    /// Last observed price of `symbol`.
    #[must_use]
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.state
            .lock()
            .last_prices
            .get(&normalize_symbol(symbol))
            .copied()
    }

    /// Last observed price of every symbol.
    #[must_use]
    pub fn all_prices(&self) -> BTreeMap<Symbol, Decimal> {
        self.state.lock().last_prices.clone()
    }

    /// Statistics snapshot, including the feed's.
    #[must_use]
    pub fn stats(&self) -> PriceStreamStats {
        let stream = self.feed.stats();
        let state = self.state.lock();

        let uptime_secs = state
            .started_at
            .map_or(0.0, |at| at.elapsed().as_secs_f64());
        #[allow(clippy::cast_precision_loss)]
        let updates = state.counters.updates_received as f64;
        let updates_per_second = if uptime_secs > 0.0 {
            updates / uptime_secs
        } else {
            0.0
        };

        PriceStreamStats {
            running: state.running,
            uptime_secs,
            updates_received: state.counters.updates_received,
            changes_detected: state.counters.changes_detected,
            spikes_detected: state.counters.spikes_detected,
            alerts_triggered: state.counters.alerts_triggered,
            symbols_tracked: state.last_prices.len(),
            alerts_active: state.alerts.len(),
            updates_per_second,
            stream,
        }
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    /// Append historical ticks of `symbol` in `[start, end]` to its history
    /// without dispatching events. Ticks with a non-positive price or a
    /// negative volume, and ticks not newer than the latest buffered one,
    /// are skipped. Sets the last price if none is known yet.
    ///
    /// Returns the number of ticks appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails.
    pub async fn seed_history(
        &self,
        port: &dyn HistoricalDataPort,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, PriceStreamError> {
        let symbol = normalize_symbol(symbol);
        let mut ticks = port.fetch(&symbol, start, end).await?;
        ticks.retain(|tick| {
            tick.symbol == symbol && tick.price > Decimal::ZERO && tick.volume >= Decimal::ZERO
        });
        ticks.sort_by_key(|tick| tick.timestamp);

        let mut state = self.state.lock();
        let newest = state
            .history
            .get(&symbol)
            .and_then(HistoryBuffer::last)
            .map(|tick| tick.timestamp);
        ticks.retain(|tick| newest.is_none_or(|newest| tick.timestamp > newest));

        if let Some(last) = ticks.last() {
            state.last_prices.entry(symbol.clone()).or_insert(last.price);
        }
        let appended = ticks.len();
        if self.config.track_history {
            let buffer = state
                .history
                .entry(symbol.clone())
                .or_insert_with(|| HistoryBuffer::new(self.config.history_capacity));
            for tick in ticks {
                buffer.push(tick);
            }
        }
        drop(state);

        tracing::info!(%symbol, appended, "Seeded price history");
        Ok(appended)
    }
}
