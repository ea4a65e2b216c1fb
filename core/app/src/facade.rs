//! Per-resource view over the sync engine.
//!
//! A [`ResourceHandle`] keeps a server-first copy of one resource, applies
//! writes optimistically and reconciles with a fresh fetch after each one.
//! Fetches are fenced by sequence number: a response that lands after a
//! newer one has been applied is discarded.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

use bizsync_common::{apply_to_collection, temp_id, Error, Operation, Result};
use bizsync_events::{names, Event, Unsubscribe};
use bizsync_sync::{FetchOutcome, SyncEngine};
use bizsync_transport::FetchOptions;

use crate::strategy::{Strategy, ValidationResult};

/// Observable state of one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub data: Vec<Value>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_online: bool,
}

struct HandleInner {
    resource: String,
    engine: SyncEngine,
    strategy: Arc<dyn Strategy>,
    view: watch::Sender<ResourceView>,
    issued: AtomicU64,
    applied: AtomicU64,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

/// Binding of one resource to UI-facing state.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<HandleInner>,
}

impl ResourceHandle {
    /// Create a handle without fetching.
    pub fn new(engine: SyncEngine, resource: impl Into<String>, strategy: Arc<dyn Strategy>) -> Self {
        let is_online = engine.is_online();
        let (view, _) = watch::channel(ResourceView {
            is_online,
            ..Default::default()
        });
        let handle = Self {
            inner: Arc::new(HandleInner {
                resource: resource.into(),
                engine,
                strategy,
                view,
                issued: AtomicU64::new(0),
                applied: AtomicU64::new(0),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };
        handle.wire();
        handle
    }

    /// Create a handle and load it from the server.
    ///
    /// A failed initial load is recorded in the view's `error`.
    pub async fn mount(
        engine: SyncEngine,
        resource: impl Into<String>,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        let handle = Self::new(engine, resource, strategy);
        if let Err(e) = handle.refresh().await {
            debug!("Initial load of {} failed: {}", handle.resource(), e);
        }
        handle
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Current state.
    pub fn view(&self) -> ResourceView {
        self.inner.view.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<ResourceView> {
        self.inner.view.subscribe()
    }

    pub fn data(&self) -> Vec<Value> {
        self.inner.view.borrow().data.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.view.borrow().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.view.borrow().loading
    }

    pub fn is_online(&self) -> bool {
        self.inner.view.borrow().is_online
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.view.borrow().last_updated
    }

    /// Forced read through the engine's fallback path.
    ///
    /// Offline, this serves whatever the local cache holds.
    pub async fn refresh(&self) -> Result<()> {
        let seq = self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.view.send_modify(|view| view.loading = true);

        let outcome = self
            .inner
            .engine
            .get_data_with_fallback(&self.inner.resource, &FetchOptions::forced())
            .await;

        match outcome {
            Ok(outcome) => {
                self.apply_fetch(seq, Ok(outcome));
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.apply_fetch(seq, Err(message));
                Err(e)
            }
        }
    }

    /// Apply a fetch result unless a newer one was already applied.
    ///
    /// Returns false for a superseded result.
    fn apply_fetch(&self, seq: u64, outcome: std::result::Result<FetchOutcome, String>) -> bool {
        let latest = self.inner.issued.load(Ordering::SeqCst) == seq;
        if self.inner.applied.fetch_max(seq, Ordering::SeqCst) > seq {
            debug!("Discarding superseded fetch #{} of {}", seq, self.inner.resource);
            return false;
        }

        self.inner.view.send_modify(|view| {
            if latest {
                view.loading = false;
            }
            match outcome {
                Ok(outcome) => {
                    view.data = match outcome.data {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        single => vec![single],
                    };
                    view.error = None;
                    view.last_updated = Some(Utc::now());
                }
                Err(message) => view.error = Some(message),
            }
        });
        true
    }

    pub async fn create(&self, payload: Value) -> Result<Value> {
        self.write(Operation::Create, payload).await
    }

    pub async fn update(&self, payload: Value) -> Result<Value> {
        self.write(Operation::Update, payload).await
    }

    pub async fn remove(&self, payload: Value) -> Result<Value> {
        self.write(Operation::Delete, payload).await
    }

    /// Validate, apply optimistically, hand off, then reconcile.
    ///
    /// Rejected payloads never reach the engine. A create without an id gets
    /// a temporary one, kept in the local cache so the record stays
    /// addressable until the server assigns its own. Whatever the engine
    /// returns, a forced re-fetch follows: on success it replaces the
    /// optimistic guess with server state, on failure it reverts it.
    async fn write(&self, operation: Operation, payload: Value) -> Result<Value> {
        let resource = self.inner.resource.as_str();
        let payload = with_operation(payload, operation);

        if let Err(e) = self.validate_data(&payload, operation).into_result() {
            self.set_error(&e);
            return Err(e);
        }
        if !self.is_operation_allowed(operation.as_str(), &payload) {
            let e = Error::PermissionDenied(format!("{} on {}", operation, resource));
            self.set_error(&e);
            return Err(e);
        }
        let mut payload = self.inner.strategy.process_data(payload, resource);
        if operation == Operation::Create && payload.get("id").is_none() {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("id".into(), Value::from(temp_id()));
            }
        }
        self.optimistic_update(|items| apply_to_collection(items, operation, &payload));

        let result = self.inner.engine.handle_data_change(resource, payload).await;
        if let Err(e) = &result {
            warn!("{} on {} failed: {}", operation, resource, e);
        }

        if let Err(e) = self.refresh().await {
            debug!("Reconciliation fetch of {} failed: {}", resource, e);
        }

        match result {
            Ok(stamped) => Ok(stamped),
            Err(e) => {
                self.set_error(&e);
                Err(e)
            }
        }
    }

    /// Mutate local data without touching the engine.
    pub fn optimistic_update<F>(&self, updater: F)
    where
        F: FnOnce(&mut Vec<Value>),
    {
        let mut data = Vec::new();
        self.inner.view.send_modify(|view| {
            updater(&mut view.data);
            data = view.data.clone();
        });
        self.inner.engine.bus().emit(
            names::updated(&self.inner.resource),
            json!({ "resource": self.inner.resource, "data": data, "source": "optimistic" }),
        );
    }

    pub fn validate_data(&self, payload: &Value, operation: Operation) -> ValidationResult {
        let payload = with_operation(payload.clone(), operation);
        self.inner.strategy.validate_data(&payload, &self.inner.resource)
    }

    pub fn is_operation_allowed(&self, operation: &str, payload: &Value) -> bool {
        self.inner.strategy.is_operation_allowed(operation, payload)
    }

    pub fn process_data(&self, payload: Value, operation: Operation) -> Value {
        let payload = with_operation(payload, operation);
        self.inner.strategy.process_data(payload, &self.inner.resource)
    }

    /// Drop every bus subscription this handle holds.
    pub fn teardown(&self) {
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }

    fn set_error(&self, error: &Error) {
        let message = error.to_string();
        self.inner.view.send_modify(|view| view.error = Some(message));
    }

    fn wire(&self) {
        let bus = self.inner.engine.bus().clone();
        let resource = self.inner.resource.clone();
        let mut subscriptions = Vec::with_capacity(5);

        for name in [names::socket_update(&resource), names::api_update(&resource)] {
            let weak = Arc::downgrade(&self.inner);
            subscriptions.push(bus.on(name, move |_| {
                if let Some(handle) = upgrade(&weak) {
                    spawn_detached(async move {
                        if let Err(e) = handle.refresh().await {
                            debug!("Background refresh of {} failed: {}", handle.resource(), e);
                        }
                    });
                }
                Ok(())
            }));
        }

        let weak = Arc::downgrade(&self.inner);
        let filter = resource.clone();
        subscriptions.push(bus.on(names::API_ERROR, move |event: &Event| {
            if event.resource() != Some(filter.as_str()) {
                return Ok(());
            }
            if let Some(handle) = upgrade(&weak) {
                let message = event
                    .data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string();
                handle.inner.view.send_modify(|view| view.error = Some(message));
            }
            Ok(())
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(bus.on(names::ONLINE, move |_| {
            if let Some(handle) = upgrade(&weak) {
                handle.inner.view.send_modify(|view| view.is_online = true);
                spawn_detached(async move {
                    if let Err(e) = handle.refresh().await {
                        debug!("Refresh after reconnect of {} failed: {}", handle.resource(), e);
                    }
                });
            }
            Ok(())
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(bus.on(names::OFFLINE, move |_| {
            if let Some(handle) = upgrade(&weak) {
                handle.inner.view.send_modify(|view| view.is_online = false);
            }
            Ok(())
        }));

        self.inner.subscriptions.lock().extend(subscriptions);
    }
}

fn upgrade(weak: &Weak<HandleInner>) -> Option<ResourceHandle> {
    weak.upgrade().map(|inner| ResourceHandle { inner })
}

fn with_operation(mut payload: Value, operation: Operation) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(Operation::FIELD.into(), Value::from(operation.as_str()));
    }
    payload
}

fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No async runtime available; background refresh dropped"),
    }
}
