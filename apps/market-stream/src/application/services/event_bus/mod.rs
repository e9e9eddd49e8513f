//! In-Process Event Bus
//!
//! Named-event publish/subscribe with priority ordering, one-shot
//! listeners, a wildcard marker, and sequential transform chains.
//!
//! # Dispatch Contract
//!
//! - The matched set is every listener registered for the event name plus
//!   every listener registered for [`WILDCARD`].
//! - Listeners run synchronously on the dispatching task, highest priority
//!   first; equal priorities run in registration order.
//! - The matched set is a snapshot: registrations made or removed by a
//!   listener take effect from the next dispatch.
//! - A once-listener is removed right after its own invocation and can
//!   never run twice, even under concurrent dispatch.
//! - A listener returning `Err` or panicking is logged and counted; the
//!   remaining listeners still run and the caller of
//!   [`EventBus::dispatch`] never sees the failure.

mod chain;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub use chain::ChainBuilder;

/// Event name matched by every dispatch.
pub const WILDCARD: &str = "*";

/// Handle returned by registration, used with [`EventBus::off`].
pub type ListenerId = u64;

/// Listener callback.
pub type Listener<T> = Arc<dyn Fn(&Event<T>) -> anyhow::Result<()> + Send + Sync>;

// =============================================================================
// Events and Options
// =============================================================================

/// A dispatched event as seen by listeners.
#[derive(Debug, Clone)]
pub struct Event<T> {
    /// Event name (never the wildcard).
    pub name: String,
    /// Event payload.
    pub payload: T,
    /// Bus-wide dispatch sequence number, starting at 1.
    pub sequence: u64,
    /// When the dispatch started.
    pub dispatched_at: DateTime<Utc>,
}

/// Registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Remove after the first invocation.
    pub once: bool,
}

impl ListenerOptions {
    /// Options with the given priority.
    #[must_use]
    pub const fn priority(priority: i32) -> Self {
        Self {
            priority,
            once: false,
        }
    }

    /// Mark the registration as one-shot.
    #[must_use]
    pub const fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

struct Registration<T> {
    id: ListenerId,
    event: String,
    callback: Listener<T>,
    priority: i32,
    once: bool,
    fired: Arc<AtomicBool>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            event: self.event.clone(),
            callback: Arc::clone(&self.callback),
            priority: self.priority,
            once: self.once,
            fired: Arc::clone(&self.fired),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of bus activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    /// Total dispatch calls.
    pub total_dispatched: u64,
    /// Dispatch calls per event name.
    pub per_event: BTreeMap<String, u64>,
    /// Registered listeners across all events.
    pub listener_count: usize,
    /// Event dispatched most often (alphabetically first on ties).
    pub most_dispatched_event: Option<String>,
    /// Dispatch count of `most_dispatched_event`.
    pub most_dispatched_count: u64,
    /// Listener invocations that failed or panicked.
    pub listener_errors: u64,
}

struct Registry<T> {
    // Kept in registration order; ids are monotonic.
    listeners: Vec<Registration<T>>,
    next_id: ListenerId,
    total_dispatched: u64,
    per_event: BTreeMap<String, u64>,
}

// =============================================================================
// Event Bus
// =============================================================================

/// Generic named-event bus.
pub struct EventBus<T> {
    registry: Mutex<Registry<T>>,
    listener_errors: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry {
                listeners: Vec::new(),
                next_id: 1,
                total_dispatched: 0,
                per_event: BTreeMap::new(),
            }),
            listener_errors: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("EventBus")
            .field("listeners", &registry.listeners.len())
            .field("total_dispatched", &registry.total_dispatched)
            .finish()
    }
}

impl<T: Send + Sync + 'static> EventBus<T> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event` (or [`WILDCARD`]).
    pub fn on<F>(&self, event: &str, options: ListenerOptions, callback: F) -> ListenerId
    where
        F: Fn(&Event<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, options, Arc::new(callback))
    }

    /// Register a listener removed after its first invocation.
    pub fn once<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Event<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(event, ListenerOptions::default().once(), callback)
    }

    pub(crate) fn register(
        &self,
        event: &str,
        options: ListenerOptions,
        callback: Listener<T>,
    ) -> ListenerId {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push(Registration {
            id,
            event: event.to_string(),
            callback,
            priority: options.priority,
            once: options.once,
            fired: Arc::new(AtomicBool::new(false)),
        });

        tracing::trace!(
            event,
            id,
            priority = options.priority,
            once = options.once,
            "Listener registered"
        );
        id
    }

    /// Remove one listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|r| r.id != id);
        registry.listeners.len() != before
    }

    /// Remove listeners registered for `event`, or every listener when
    /// `event` is `None`. Returns how many were removed.
    pub fn remove_all_listeners(&self, event: Option<&str>) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.listeners.len();
        match event {
            Some(name) => registry.listeners.retain(|r| r.event != name),
            None => registry.listeners.clear(),
        }
        before - registry.listeners.len()
    }

    /// Listeners registered directly for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .lock()
            .listeners
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    /// Whether a dispatch of `event` would reach any listener, wildcard
    /// listeners included.
    #[must_use]
    pub fn has_listeners(&self, event: &str) -> bool {
        self.registry
            .lock()
            .listeners
            .iter()
            .any(|r| r.event == event || r.event == WILDCARD)
    }

    /// Distinct event names with at least one listener, sorted.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        let registry = self.registry.lock();
        let mut names: Vec<String> = registry.listeners.iter().map(|r| r.event.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Dispatch `payload` under `event`.
    ///
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, event: &str, payload: T) -> usize {
        let (matched, sequence) = {
            let mut registry = self.registry.lock();
            registry.total_dispatched += 1;
            *registry.per_event.entry(event.to_string()).or_insert(0) += 1;

            let mut matched: Vec<Registration<T>> = registry
                .listeners
                .iter()
                .filter(|r| r.event == event || r.event == WILDCARD)
                .cloned()
                .collect();
            // Stable sort keeps registration order within a priority.
            matched.sort_by(|a, b| b.priority.cmp(&a.priority));
            (matched, registry.total_dispatched)
        };

        let event = Event {
            name: event.to_string(),
            payload,
            sequence,
            dispatched_at: Utc::now(),
        };

        let mut invoked = 0;
        for registration in matched {
            if registration.once && registration.fired.swap(true, Ordering::AcqRel) {
                continue;
            }

            invoked += 1;
            self.invoke(&registration, &event);

            if registration.once {
                self.off(registration.id);
            }
        }

        invoked
    }

    fn invoke(&self, registration: &Registration<T>, event: &Event<T>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (registration.callback)(event)));

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => format!("{error:#}"),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        self.listener_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            event = %event.name,
            listener = registration.id,
            error = %failure,
            "Listener failed"
        );
    }

    /// Start building a transform chain for `event`.
    #[must_use]
    pub fn chain(&self, event: &str) -> ChainBuilder<'_, T>
    where
        T: Clone,
    {
        ChainBuilder::new(self, event)
    }

    /// Snapshot of bus activity.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        let registry = self.registry.lock();

        let mut most: Option<(&String, u64)> = None;
        for (name, &count) in &registry.per_event {
            if most.is_none_or(|(_, best)| count > best) {
                most = Some((name, count));
            }
        }

        EventBusStats {
            total_dispatched: registry.total_dispatched,
            per_event: registry.per_event.clone(),
            listener_count: registry.listeners.len(),
            most_dispatched_event: most.map(|(name, _)| name.clone()),
            most_dispatched_count: most.map_or(0, |(_, count)| count),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
        }
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Listener<u32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |tag: &str| -> Listener<u32> {
                let log = Arc::clone(&log);
                let tag = tag.to_string();
                Arc::new(move |event: &Event<u32>| {
                    log.lock().push(format!("{tag}:{}", event.name));
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn higher_priority_runs_first() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.register("tick", ListenerOptions::priority(1), make("low"));
        bus.register("tick", ListenerOptions::priority(10), make("high"));

        bus.dispatch("tick", 1);
        assert_eq!(*log.lock(), vec!["high:tick", "low:tick"]);
    }

    #[test]
    fn equal_priority_keeps_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.register("tick", ListenerOptions::default(), make("a"));
        bus.register("tick", ListenerOptions::default(), make("b"));
        bus.register("tick", ListenerOptions::priority(-1), make("c"));
        bus.register("tick", ListenerOptions::default(), make("d"));

        bus.dispatch("tick", 1);
        assert_eq!(*log.lock(), vec!["a:tick", "b:tick", "d:tick", "c:tick"]);
    }

    #[test]
    fn wildcard_receives_every_event() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.register(WILDCARD, ListenerOptions::default(), make("all"));
        bus.register("a", ListenerOptions::default(), make("only-a"));

        bus.dispatch("a", 1);
        bus.dispatch("b", 2);
        bus.dispatch("c", 3);

        assert_eq!(
            *log.lock(),
            vec!["all:a", "only-a:a", "all:b", "all:c"]
        );
    }

    #[test]
    fn once_listener_fires_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);

        bus.once("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.dispatch("tick", 1), 1);
        assert_eq!(bus.dispatch("tick", 2), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("tick"), 0);
    }

    #[test]
    fn failing_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.on("tick", ListenerOptions::priority(5), |_| {
            Err(anyhow::anyhow!("boom"))
        });
        bus.on("tick", ListenerOptions::priority(4), |_| panic!("listener panic"));
        bus.register("tick", ListenerOptions::default(), make("survivor"));

        assert_eq!(bus.dispatch("tick", 1), 3);
        assert_eq!(*log.lock(), vec!["survivor:tick"]);
        assert_eq!(bus.stats().listener_errors, 2);
    }

    #[test]
    fn registration_during_dispatch_applies_next_time() {
        let bus = Arc::new(EventBus::<u32>::new());
        let (log, make) = recorder();

        let inner_bus = Arc::clone(&bus);
        let late = make("late");
        bus.once("tick", move |_| {
            inner_bus.register("tick", ListenerOptions::priority(100), Arc::clone(&late));
            Ok(())
        });

        bus.dispatch("tick", 1);
        assert!(log.lock().is_empty());

        bus.dispatch("tick", 2);
        assert_eq!(*log.lock(), vec!["late:tick"]);
    }

    #[test]
    fn removal_during_dispatch_applies_next_time() {
        let bus = Arc::new(EventBus::<u32>::new());
        let (log, make) = recorder();

        let low = bus.register("tick", ListenerOptions::priority(0), make("low"));
        let inner_bus = Arc::clone(&bus);
        bus.on("tick", ListenerOptions::priority(10), move |_| {
            inner_bus.off(low);
            Ok(())
        });

        assert_eq!(bus.dispatch("tick", 1), 2);
        assert_eq!(*log.lock(), vec!["low:tick"]);

        assert_eq!(bus.dispatch("tick", 2), 1);
        assert_eq!(*log.lock(), vec!["low:tick"]);
        assert_eq!(bus.listener_count("tick"), 1);
    }

    #[test]
    fn off_and_remove_all() {
        let bus = EventBus::new();
        let (_, make) = recorder();

        let a = bus.register("a", ListenerOptions::default(), make("a"));
        bus.register("a", ListenerOptions::default(), make("a2"));
        bus.register("b", ListenerOptions::default(), make("b"));

        assert!(bus.off(a));
        assert!(!bus.off(a));
        assert_eq!(bus.event_names(), vec!["a", "b"]);

        assert_eq!(bus.remove_all_listeners(Some("a")), 1);
        assert!(!bus.has_listeners("a"));
        assert!(bus.has_listeners("b"));

        assert_eq!(bus.remove_all_listeners(None), 1);
        assert_eq!(bus.stats().listener_count, 0);
    }

    #[test]
    fn stats_track_most_dispatched() {
        let bus = EventBus::<u32>::new();
        assert_eq!(bus.stats().most_dispatched_event, None);

        bus.dispatch("b", 1);
        bus.dispatch("a", 1);
        bus.dispatch("b", 1);
        bus.dispatch("c", 1);

        let stats = bus.stats();
        assert_eq!(stats.total_dispatched, 4);
        assert_eq!(stats.per_event.get("b"), Some(&2));
        assert_eq!(stats.most_dispatched_event.as_deref(), Some("b"));
        assert_eq!(stats.most_dispatched_count, 2);
    }

    #[test]
    fn event_carries_sequence() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        bus.on("x", ListenerOptions::default(), move |event: &Event<u32>| {
            sink.lock().push((event.sequence, event.payload));
            Ok(())
        });

        bus.dispatch("x", 7);
        bus.dispatch("y", 8);
        bus.dispatch("x", 9);

        assert_eq!(*seen.lock(), vec![(1, 7), (3, 9)]);
    }
}
