//! Transform chains.
//!
//! A chain is a listener that threads the payload through ordered stages.
//! Each dispatch runs independently: a stage returning `Ok(None)` stops the
//! remaining stages for that dispatch only, and a failing or panicking stage
//! hands the error to the `catch` handler (or to the bus boundary when no
//! handler is set) and skips the rest of that dispatch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::{Event, EventBus, ListenerId, ListenerOptions, panic_message};

type Stage<T> = Arc<dyn Fn(T) -> anyhow::Result<Option<T>> + Send + Sync>;
type CatchHandler<T> = Arc<dyn Fn(&anyhow::Error, &Event<T>) + Send + Sync>;

/// Builder returned by [`EventBus::chain`].
#[must_use = "a chain does nothing until `execute` is called"]
pub struct ChainBuilder<'a, T> {
    bus: &'a EventBus<T>,
    event: String,
    stages: Vec<Stage<T>>,
    catch: Option<CatchHandler<T>>,
    priority: i32,
}

impl<'a, T> ChainBuilder<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(super) fn new(bus: &'a EventBus<T>, event: &str) -> Self {
        Self {
            bus,
            event: event.to_string(),
            stages: Vec::new(),
            catch: None,
            priority: 0,
        }
    }

    /// Append a stage. Return `Ok(None)` to stop the chain for this dispatch.
    pub fn then<F>(mut self, stage: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Handle stage failures instead of reporting them to the bus.
    pub fn catch<F>(mut self, handler: F) -> Self
    where
        F: Fn(&anyhow::Error, &Event<T>) + Send + Sync + 'static,
    {
        self.catch = Some(Arc::new(handler));
        self
    }

    /// Listener priority of the installed chain.
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Install the chain as a listener on the event.
    ///
    /// Remove it again with [`EventBus::off`].
    pub fn execute(self) -> ListenerId {
        let Self {
            bus,
            event,
            stages,
            catch,
            priority,
        } = self;
        let stage_count = stages.len();

        let id = bus.register(
            &event,
            ListenerOptions::priority(priority),
            Arc::new(move |dispatched: &Event<T>| run_stages(&stages, catch.as_ref(), dispatched)),
        );

        tracing::debug!(event = %event, id, stages = stage_count, "Chain installed");
        id
    }
}

fn run_stages<T: Clone>(
    stages: &[Stage<T>],
    catch: Option<&CatchHandler<T>>,
    event: &Event<T>,
) -> anyhow::Result<()> {
    let mut value = event.payload.clone();

    for (index, stage) in stages.iter().enumerate() {
        let outcome = match catch_unwind(AssertUnwindSafe(|| stage(value))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!(
                "panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match outcome {
            Ok(Some(next)) => value = next,
            Ok(None) => {
                tracing::trace!(event = %event.name, stage = index, "Chain stopped");
                return Ok(());
            }
            Err(error) => {
                let error = error.context(format!("chain stage {index} on `{}`", event.name));
                return match catch {
                    Some(handler) => {
                        handler(&error, event);
                        Ok(())
                    }
                    None => Err(error),
                };
            }
        }
    }

    Ok(())
}
