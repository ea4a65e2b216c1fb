//! Event bus with middleware and synchronous dispatch.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};
use uuid::Uuid;

use crate::names;

/// Error returned by a failing subscriber.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a subscriber.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Middleware: returns the (possibly rewritten) event, or `None` to veto delivery.
pub type Middleware = Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>;

/// Unique id of a subscription, assigned per `on()` call.
pub type SubscriptionId = u64;

/// An emitted event. The copy handed to subscribers is the post-middleware one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub data: Value,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(name: String, data: Value, context: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            data,
            context,
            timestamp: Utc::now(),
        }
    }

    /// `data.resource` as a string, if present.
    pub fn resource(&self) -> Option<&str> {
        self.data.get("resource").and_then(Value::as_str)
    }
}

/// Options for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first invocation.
    pub once: bool,
    /// Free-form label shown in logs.
    pub label: Option<String>,
}

impl SubscribeOptions {
    pub fn once() -> Self {
        Self {
            once: true,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Identifies a subscription to remove.
pub enum Listener<'a> {
    Id(SubscriptionId),
    Handler(&'a Handler),
}

impl From<SubscriptionId> for Listener<'_> {
    fn from(id: SubscriptionId) -> Self {
        Listener::Id(id)
    }
}

impl<'a> From<&'a Handler> for Listener<'a> {
    fn from(handler: &'a Handler) -> Self {
        Listener::Handler(handler)
    }
}

/// Snapshot of bus activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub events_blocked: u64,
    pub handler_errors: u64,
    pub middleware: usize,
    pub subscriptions: BTreeMap<String, usize>,
}

impl BusStats {
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.values().sum()
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
    options: SubscribeOptions,
    fired: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    middleware: RwLock<Vec<Middleware>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
    blocked: AtomicU64,
    handler_errors: AtomicU64,
}

impl Inner {
    fn remove(&self, name: &str, listener: Listener<'_>) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        match listener {
            Listener::Id(id) => list.retain(|s| s.id != id),
            Listener::Handler(handler) => list.retain(|s| !same_handler(&s.handler, handler)),
        }
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(name);
        }
        removed
    }
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Handle returned by [`EventBus::on`]. Dropping it keeps the subscription.
#[must_use = "keep the handle to unsubscribe later"]
#[derive(Debug)]
pub struct Unsubscribe {
    bus: Weak<Inner>,
    name: String,
    id: SubscriptionId,
}

impl Unsubscribe {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event_name(&self) -> &str {
        &self.name
    }

    /// Remove the subscription. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.remove(&self.name, Listener::Id(self.id)),
            None => false,
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("emitted", &self.emitted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Publish/subscribe hub. Cheap to clone; clones share subscribers.
#[derive(Clone, Default, Debug)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `name`.
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> Unsubscribe
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(callback), SubscribeOptions::default())
    }

    /// Subscribe to `name`, removed automatically after the first delivery.
    pub fn once<F>(&self, name: impl Into<String>, callback: F) -> Unsubscribe
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(callback), SubscribeOptions::once())
    }

    /// Subscribe a shared handler, so it can later be removed by identity.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        handler: Handler,
        options: SubscribeOptions,
    ) -> Unsubscribe {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(event = %name, id, label = ?options.label, "subscribed");

        self.inner
            .subscribers
            .write()
            .entry(name.clone())
            .or_default()
            .push(Subscriber {
                id,
                handler,
                options,
                fired: Arc::new(AtomicBool::new(false)),
            });

        Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            name,
            id,
        }
    }

    /// Remove a subscription by id or by handler identity.
    pub fn off<'a>(&self, name: &str, listener: impl Into<Listener<'a>>) -> bool {
        self.inner.remove(name, listener.into())
    }

    /// Register middleware. Middleware runs in registration order.
    pub fn use_middleware<F>(&self, middleware: F)
    where
        F: Fn(Event) -> Option<Event> + Send + Sync + 'static,
    {
        self.inner.middleware.write().push(Arc::new(middleware));
    }

    /// Emit an event with an empty context.
    pub fn emit(&self, name: impl Into<String>, data: Value) -> Option<Event> {
        self.emit_with_context(name, data, Value::Null)
    }

    /// Build the envelope, run middleware, then deliver to every subscriber.
    ///
    /// Returns the delivered envelope, or `None` if middleware vetoed it.
    pub fn emit_with_context(
        &self,
        name: impl Into<String>,
        data: Value,
        context: Value,
    ) -> Option<Event> {
        let mut event = Event::new(name.into(), data, context);
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);

        let middleware: Vec<Middleware> = self.inner.middleware.read().clone();
        for mw in middleware {
            match mw(event) {
                Some(next) => event = next,
                None => {
                    self.inner.blocked.fetch_add(1, Ordering::Relaxed);
                    debug!("event blocked by middleware");
                    return None;
                }
            }
        }

        // Snapshot so handlers can subscribe, unsubscribe or emit re-entrantly.
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .read()
            .get(&event.name)
            .cloned()
            .unwrap_or_default();

        let mut spent = Vec::new();
        for sub in &subscribers {
            if sub.options.once {
                if sub.fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                spent.push(sub.id);
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            if let Some(message) = failure {
                self.inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    event = %event.name,
                    subscription = sub.id,
                    label = ?sub.options.label,
                    "event handler failed: {}",
                    message
                );
                if event.name != names::BUS_ERROR {
                    self.emit(
                        names::BUS_ERROR,
                        json!({
                            "event": event.name,
                            "eventId": event.id,
                            "subscriptionId": sub.id,
                            "error": message,
                        }),
                    );
                }
            }
        }

        for id in spent {
            self.inner.remove(&event.name, Listener::Id(id));
        }

        Some(event)
    }

    /// Number of live subscriptions for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(name)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_emitted: self.inner.emitted.load(Ordering::Relaxed),
            events_blocked: self.inner.blocked.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
            middleware: self.inner.middleware.read().len(),
            subscriptions: self
                .inner
                .subscribers
                .read()
                .iter()
                .map(|(name, subs)| (name.clone(), subs.len()))
                .collect(),
        }
    }

    /// Drop every subscription and middleware.
    pub fn clear(&self) {
        self.inner.subscribers.write().clear();
        self.inner.middleware.write().clear();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
