//! Application Services
//!
//! - `EventBus`: in-process publish/subscribe for price events
//! - `PriceStream`: turns feed ticks into `price.*` events, tracks last
//!   prices, history and alert rules

pub mod event_bus;
pub mod price_stream;

pub use event_bus::{
    ChainBuilder, Event, EventBus, EventBusStats, Listener, ListenerId, ListenerOptions, WILDCARD,
};
pub use price_stream::{
    PRICE_ALERT, PRICE_CHANGE, PRICE_SPIKE, PRICE_UPDATE, PriceAlert, PriceEvent, PriceStream,
    PriceStreamConfig, PriceStreamError, PriceStreamStats, PriceUpdate,
};
