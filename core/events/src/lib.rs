//! Process-wide publish/subscribe hub.
//!
//! Every bizsync component talks to the others through an [`EventBus`]
//! instead of holding direct references. Dispatch is synchronous: each
//! subscriber for an event runs to completion, in subscription order, before
//! `emit` returns.

pub mod bus;
pub mod names;

pub use bus::{
    BusStats, Event, EventBus, Handler, HandlerError, HandlerResult, Listener, Middleware,
    SubscribeOptions, SubscriptionId, Unsubscribe,
};
