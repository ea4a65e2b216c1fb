//! Sync orchestrator.
//!
//! [`SyncEngine`] ties the registry, processor, local store and both
//! transports together. Writes are stamped and cached locally first, then
//! delivered (online) or queued (offline); the queue drains when
//! connectivity returns. Reads go cache-first with a network fallback.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bizsync_common::{
    apply_to_collection, is_temp_id, item_id, BusinessType, CachedRecord, Error, Operation,
    ResourceConfig, ResourceOverrides, Result, StaleDataWarning, SyncQueueItem,
};
use bizsync_events::{names, EventBus, Unsubscribe};
use bizsync_storage::LocalStore;
use bizsync_transport::endpoint::BUSINESS_TYPE_PLACEHOLDER;
use bizsync_transport::{
    FetchOptions, PushAdapter, RealtimeTransport, RequestTransport, RestAdapter, WriteEnvelope,
};

use crate::conflict::{ConflictInfo, ConflictResolver, ConflictStrategy, Resolution};
use crate::connectivity::ConnectivityMonitor;
use crate::processor::DataProcessor;
use crate::registry::ResourceRegistry;
use crate::retry::RetryConfig;
use crate::scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler};
use crate::state::SyncState;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts before a queued write is dropped.
    pub max_retries: u32,
    /// Backoff between attempts of one queued write.
    pub retry: RetryConfig,
    pub api_base_url: String,
    /// Push endpoint; no push connection is opened when unset.
    pub socket_url: Option<String>,
    pub conflict_strategy: ConflictStrategy,
    pub sync_mode: SyncMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry: RetryConfig::default(),
            api_base_url: "http://localhost:3000".to_string(),
            socket_url: None,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            sync_mode: SyncMode::Manual,
        }
    }
}

/// External collaborators the engine is built from.
pub struct EngineComponents {
    pub bus: EventBus,
    pub store: Arc<dyn LocalStore>,
    /// Channel for resources with `requires_auth`.
    pub authenticated: Arc<dyn RequestTransport>,
    pub public: Arc<dyn RequestTransport>,
    pub realtime: Arc<dyn RealtimeTransport>,
    pub connectivity: Arc<dyn ConnectivityMonitor>,
}

/// Where a fallback read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Network,
    Cache,
}

/// Result of [`SyncEngine::get_data_with_fallback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub data: Value,
    pub source: DataSource,
    /// Set when a cached copy older than the resource allows was returned.
    pub stale: Option<StaleDataWarning>,
}

/// Result of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueReport {
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Items still backing off or waiting for a business type.
    pub deferred: usize,
    pub remaining: usize,
    /// The drain did not run (offline or already running).
    pub skipped: bool,
}

struct EngineInner {
    config: EngineConfig,
    bus: EventBus,
    store: Arc<dyn LocalStore>,
    registry: Arc<ResourceRegistry>,
    processor: DataProcessor,
    rest: RestAdapter,
    push: PushAdapter,
    connectivity: Arc<dyn ConnectivityMonitor>,
    resolver: ConflictResolver,
    online: AtomicBool,
    initialized: AtomicBool,
    sync_in_progress: AtomicBool,
    /// In-memory mirror of the durable queue.
    queue: Mutex<Vec<SyncQueueItem>>,
    state: RwLock<SyncState>,
    /// Serializes read-modify-write cycles on cached records.
    cache_lock: tokio::sync::Mutex<()>,
    wired: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Central sync coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, components: EngineComponents) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        let rest = RestAdapter::new(
            components.authenticated,
            components.public,
            components.bus.clone(),
        );
        let push = PushAdapter::new(components.realtime, components.bus.clone());
        let resolver = ConflictResolver::new(config.conflict_strategy);

        Self {
            inner: Arc::new(EngineInner {
                processor: DataProcessor::new(registry.clone()),
                registry,
                rest,
                push,
                resolver,
                bus: components.bus,
                store: components.store,
                connectivity: components.connectivity,
                online: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                sync_in_progress: AtomicBool::new(false),
                queue: Mutex::new(Vec::new()),
                state: RwLock::new(SyncState::new()),
                cache_lock: tokio::sync::Mutex::new(()),
                wired: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.inner.registry
    }

    pub fn processor(&self) -> &DataProcessor {
        &self.inner.processor
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }

    pub fn push(&self) -> &PushAdapter {
        &self.inner.push
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.inner.sync_in_progress.load(Ordering::SeqCst)
    }

    pub fn business_type(&self) -> Option<BusinessType> {
        self.inner.registry.business_type()
    }

    /// Snapshot of the in-memory queue mirror, oldest first.
    pub fn queued_items(&self) -> Vec<SyncQueueItem> {
        self.inner.queue.lock().clone()
    }

    /// Diagnostic snapshot of per-resource sync state.
    pub fn state_snapshot(&self) -> SyncState {
        self.inner.state.read().clone()
    }

    /// Open the store, seed the general resources and start listening.
    ///
    /// Emits `datasync:initialized`, or `datasync:init-error` before
    /// returning the error. Calling it again after success is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::SeqCst) {
            debug!("Sync engine already initialized");
            return Ok(());
        }

        match self.try_initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Sync engine initialization failed: {}", e);
                self.inner.bus.emit(
                    names::INIT_ERROR,
                    json!({ "error": e.to_string(), "kind": e.kind() }),
                );
                Err(e)
            }
        }
    }

    async fn try_initialize(&self) -> Result<()> {
        let inner = &self.inner;
        inner.store.open().await?;

        let queued = inner.store.queue_items().await?;
        let queued_count = queued.len();
        *inner.queue.lock() = queued;

        let resources = inner.registry.seed_general();
        for name in &resources {
            self.wire_resource(name);
        }
        self.wire_socket_listener();

        let online = self.spawn_connectivity_watcher();
        inner.online.store(online, Ordering::SeqCst);
        inner.state.write().is_online = online;
        self.refresh_pending();

        if online {
            self.connect_push().await;
        }

        inner.initialized.store(true, Ordering::SeqCst);
        info!(
            "Sync engine initialized ({} resources, {} queued, online: {})",
            resources.len(),
            queued_count,
            online
        );
        inner.bus.emit(
            names::INITIALIZED,
            json!({ "resources": resources, "online": online, "queued": queued_count }),
        );

        if online && queued_count > 0 {
            if let Err(e) = self.process_sync_queue().await {
                warn!("Initial queue drain failed: {}", e);
            }
        }
        Ok(())
    }

    /// Register a resource and start listening for its change events.
    pub fn register_resource(
        &self,
        name: impl Into<String>,
        overrides: ResourceOverrides,
    ) -> ResourceConfig {
        let config = self.inner.registry.register_resource(name, overrides);
        self.wire_resource(&config.name);
        config
    }

    /// Activate a business vertical. Returns false if it was already active.
    ///
    /// Queued writes held back for want of a business type are drained in
    /// the background when online.
    pub fn set_business_type(&self, business_type: BusinessType) -> bool {
        let Some(resources) = self.inner.registry.set_business_type(business_type.clone()) else {
            return false;
        };
        for name in &resources {
            self.wire_resource(name);
        }
        self.inner.bus.emit(
            names::BUSINESS_TYPE_SET,
            json!({ "businessType": business_type.as_str(), "resources": resources }),
        );

        if self.is_online() && !self.inner.queue.lock().is_empty() {
            let engine = self.clone();
            spawn_detached(async move {
                if let Err(e) = engine.process_sync_queue().await {
                    warn!("Queue drain after business type change failed: {}", e);
                }
            });
        }
        true
    }

    /// Stamp, cache and deliver (or queue) one write.
    ///
    /// Returns the stamped payload. Offline writes, and writes whose endpoint
    /// needs a business type that is not set yet, are queued and succeed.
    /// An edit of a record whose create is still queued under a temporary id
    /// is folded into that create. Every online delivery failure is queued
    /// and the error is still returned so callers can roll back optimistic
    /// state; the queue's retry limit is the only point where a write is
    /// given up.
    ///
    /// # Errors
    /// - `UnregisteredResource` for unknown names (nothing is cached or queued)
    /// - Whatever delivery failed with when online
    pub async fn handle_data_change(&self, resource: &str, data: Value) -> Result<Value> {
        let config = self.require(resource)?;
        let operation = Operation::from_payload(&data);

        let mut stamped = self.inner.processor.add_metadata(data);
        if let Some(obj) = stamped.as_object_mut() {
            obj.entry(Operation::FIELD.to_string())
                .or_insert_with(|| json!(operation));
        }

        if config.enable_offline {
            self.write_through(resource, operation, &stamped).await?;
        }

        if self.fold_into_pending_create(resource, operation, &stamped).await? {
            return Ok(stamped);
        }

        if !self.is_online() {
            debug!("Offline; queueing {} {}", operation, resource);
            self.enqueue(resource, operation, stamped.clone()).await?;
            return Ok(stamped);
        }
        if self.awaits_business_type(&config, operation) {
            debug!("No business type yet; queueing {} {}", operation, resource);
            self.enqueue(resource, operation, stamped.clone()).await?;
            return Ok(stamped);
        }

        match self.sync_data(resource, &stamped).await {
            Ok(()) => Ok(stamped),
            Err(e) => {
                self.enqueue(resource, operation, stamped).await?;
                Err(e)
            }
        }
    }

    /// Deliver one stamped write over every applicable channel.
    ///
    /// The request adapter is used when the resource has an endpoint for the
    /// operation; the push adapter is used in addition when it is connected
    /// and the resource declares push events. A push failure after a
    /// successful request is only reported.
    pub async fn sync_data(&self, resource: &str, data: &Value) -> Result<()> {
        let inner = &self.inner;
        let config = self.require(resource)?;
        let operation = Operation::from_payload(data);
        let business_type = inner.registry.business_type();
        inner.state.write().entry(resource).mark_syncing();

        let mut channels: Vec<&str> = Vec::new();
        let mut failure: Option<Error> = None;

        let api_attempted = config.endpoints.for_operation(operation).is_some();
        if api_attempted {
            match inner
                .rest
                .sync_via_api(resource, data, &config, business_type.as_ref())
                .await
            {
                Ok(_) => channels.push("api"),
                Err(e) => failure = Some(e),
            }
        }
        // The request adapter has already reported its own failure.
        let api_failed = failure.is_some();

        let push_declared = !config.push_event_names.is_empty();
        if push_declared && inner.push.is_connected() {
            let envelope = WriteEnvelope::from_payload(resource, data).to_value();
            match inner.push.sync_via_socket(resource, &envelope, &config).await {
                Ok(()) => channels.push("socket"),
                Err(e) if api_attempted => {
                    warn!("Push delivery of {} failed: {}", resource, e);
                    inner.bus.emit(
                        names::SOCKET_ERROR,
                        json!({ "resource": resource, "error": e.to_string() }),
                    );
                }
                Err(e) => failure = Some(e),
            }
        }

        if failure.is_none() && channels.is_empty() {
            failure = Some(if push_declared {
                Error::NotConnected(format!("No open channel to deliver '{}'", resource))
            } else {
                Error::InvalidInput(format!(
                    "Resource '{}' has no {} endpoint and no push events",
                    resource, operation
                ))
            });
        }

        match failure {
            None => {
                inner.state.write().entry(resource).mark_synced();
                debug!("Delivered {} {} via {:?}", operation, resource, channels);
                inner.bus.emit(
                    names::SYNCED,
                    json!({
                        "resource": resource,
                        "operation": operation,
                        "channels": channels,
                        "id": item_id(data),
                    }),
                );
                Ok(())
            }
            Some(e) => {
                inner.state.write().entry(resource).mark_failed(e.to_string());
                if !api_failed {
                    error!("Sync of {} failed: {}", resource, e);
                    inner.bus.emit(
                        names::SYNC_FAILED,
                        json!({
                            "resource": resource,
                            "operation": operation,
                            "error": e.to_string(),
                            "kind": e.kind(),
                            "retryable": e.is_retryable(),
                        }),
                    );
                }
                Err(e)
            }
        }
    }

    /// Drain the retry queue in FIFO order.
    ///
    /// Only one drain runs at a time; a concurrent call returns a skipped
    /// report. Items still backing off are left in place, as are items that
    /// cannot be addressed before a business type is set; neither uses up a
    /// retry.
    pub async fn process_sync_queue(&self) -> Result<QueueReport> {
        let inner = &self.inner;
        if !self.is_online() {
            debug!("Offline; queue drain skipped");
            return Ok(QueueReport {
                remaining: inner.queue.lock().len(),
                skipped: true,
                ..Default::default()
            });
        }
        if inner
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue drain already in progress");
            return Ok(QueueReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _drain = DrainGuard::new(inner);

        let items = inner.store.queue_items().await?;
        *inner.queue.lock() = items.clone();
        let mut report = QueueReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        info!("Processing {} queued writes", items.len());
        inner
            .bus
            .emit(names::QUEUE_PROCESSING, json!({ "count": items.len() }));

        let now = chrono::Utc::now();
        for mut item in items {
            if !self.is_online() {
                report.remaining += 1;
                continue;
            }
            if !item.is_due(now) {
                report.deferred += 1;
                continue;
            }
            if self.queued_item_blocked(&item) {
                debug!("Queued write {} waits for a business type", item.id);
                report.deferred += 1;
                continue;
            }

            match self.sync_data(&item.resource, &item.payload).await {
                Ok(()) => {
                    inner.store.remove_queue_item(&item.id).await?;
                    self.forget_queued(&item.id);
                    debug!("Delivered queued write {}", item.id);
                    report.processed += 1;
                }
                Err(e) => {
                    let backoff = inner.config.retry.backoff_for_attempt(item.retry_count);
                    if item.record_failure(e.to_string(), backoff) {
                        inner.store.remove_queue_item(&item.id).await?;
                        self.forget_queued(&item.id);
                        let exhausted = Error::QueueExhausted {
                            resource: item.resource.clone(),
                            item_id: item.id.clone(),
                            attempts: item.retry_count,
                        };
                        error!("{} (last error: {})", exhausted, e);
                        inner.bus.emit(
                            names::QUEUE_FAILED,
                            json!({
                                "item": item,
                                "error": exhausted.to_string(),
                                "lastError": e.to_string(),
                            }),
                        );
                        report.failed += 1;
                    } else {
                        inner.store.put_queue_item(&item).await?;
                        warn!(
                            "Queued write {} failed (attempt {}/{}): {}",
                            item.id, item.retry_count, item.max_retries, e
                        );
                        self.remember_queued(item);
                        report.retried += 1;
                    }
                }
            }
        }

        report.remaining += report.retried + report.deferred;
        self.refresh_pending();
        inner.state.write().last_queue_drain = Some(chrono::Utc::now());
        inner
            .bus
            .emit(names::QUEUE_PROCESSED, serde_json::to_value(&report)?);
        Ok(report)
    }

    /// Apply an online/offline transition.
    ///
    /// Going online reconnects the push channel (when configured) and drains
    /// the queue. Repeating the current state does nothing.
    pub async fn handle_connectivity_change(&self, online: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.online.swap(online, Ordering::SeqCst) == online {
            return Ok(());
        }
        inner.state.write().is_online = online;

        if online {
            let queued = inner.queue.lock().len();
            info!("Connectivity restored ({} queued writes)", queued);
            inner.bus.emit(names::ONLINE, json!({ "queued": queued }));
            self.connect_push().await;
            self.process_sync_queue().await?;
        } else {
            warn!("Connectivity lost");
            inner.bus.emit(names::OFFLINE, json!({}));
        }
        Ok(())
    }

    /// Cache-first read with network fallback.
    ///
    /// The network is consulted when the cache is empty or stale (or
    /// `options.force` is set) and the engine is online; otherwise the cached
    /// copy is returned, possibly stale.
    ///
    /// # Errors
    /// - `UnregisteredResource` for unknown names
    /// - Whatever the network read failed with; `datasync:error` is emitted first
    pub async fn get_data_with_fallback(
        &self,
        resource: &str,
        options: &FetchOptions,
    ) -> Result<FetchOutcome> {
        let inner = &self.inner;
        let config = self.require(resource)?;

        let cached = if config.enable_offline {
            inner.store.get(resource).await?
        } else {
            None
        };
        let stale = cached
            .as_ref()
            .and_then(|record| inner.processor.check_staleness(record, &config));
        let cache_usable = cached.as_ref().is_some_and(|r| !r.is_empty());
        let wants_network = options.force || !cache_usable || stale.is_some();

        if wants_network && self.is_online() {
            return match self.fetch_fresh(resource, options, &config, cached.as_ref()).await {
                Ok(data) => Ok(FetchOutcome {
                    data,
                    source: DataSource::Network,
                    stale: None,
                }),
                Err(e) => {
                    error!("Read of {} failed: {}", resource, e);
                    inner.bus.emit(
                        names::ERROR,
                        json!({
                            "resource": resource,
                            "operation": "read",
                            "error": e.to_string(),
                            "kind": e.kind(),
                            "retryable": e.is_retryable(),
                        }),
                    );
                    Err(e)
                }
            };
        }

        if let Some(warning) = &stale {
            warn!(
                "Serving stale {} from cache ({} ms old, limit {} ms)",
                resource, warning.age_ms, warning.max_age_ms
            );
            inner
                .bus
                .emit(names::STALE_DATA, serde_json::to_value(warning)?);
        }

        Ok(FetchOutcome {
            data: cached.map_or_else(|| Value::Array(Vec::new()), |r| r.payload),
            source: DataSource::Cache,
            stale,
        })
    }

    async fn fetch_fresh(
        &self,
        resource: &str,
        options: &FetchOptions,
        config: &ResourceConfig,
        previous: Option<&CachedRecord>,
    ) -> Result<Value> {
        let inner = &self.inner;
        let business_type = inner.registry.business_type();
        let raw = inner
            .rest
            .fetch_from_api(resource, options, config, business_type.as_ref())
            .await?;

        let normalized = inner.processor.process_response(resource, raw);
        let fresh = inner.processor.add_metadata(normalized);

        if config.enable_offline && options.id.is_none() {
            let _guard = inner.cache_lock.lock().await;
            let record = CachedRecord::new(
                resource,
                fresh.clone(),
                business_type.map(|bt| bt.as_str().to_string()),
                previous,
            );
            inner.store.put(record).await?;
        }

        inner.state.write().entry(resource).mark_fetched();
        inner.bus.emit(
            names::updated(resource),
            json!({ "resource": resource, "data": fresh, "source": "network" }),
        );
        Ok(fresh)
    }

    /// Apply items pushed by the server to the local cache.
    ///
    /// An item with a pending local write is a conflict and goes through the
    /// configured resolver; when the remote side wins the pending writes for
    /// that entity are discarded. Returns how many items were applied.
    pub async fn apply_remote_update(&self, resource: &str, data: &Value) -> Result<usize> {
        let inner = &self.inner;
        let Some(config) = inner.registry.get_resource(resource) else {
            debug!("Ignoring push update for unregistered resource {}", resource);
            return Ok(0);
        };
        let incoming = match data {
            Value::Array(items) => items.clone(),
            Value::Object(_) => vec![data.clone()],
            _ => return Ok(0),
        };
        let normalized = inner
            .processor
            .process_response(resource, Value::Array(incoming));
        let Value::Array(remote_items) = normalized else {
            return Ok(0);
        };

        let _guard = inner.cache_lock.lock().await;
        let previous = inner.store.get(resource).await?;
        let mut collection = previous.as_ref().map(CachedRecord::items).unwrap_or_default();
        let mut applied = 0;

        for remote in remote_items {
            let Some(id) = item_id(&remote) else {
                continue;
            };

            let pending = self.pending_for(resource, &id);
            if let Some(local) = pending.last().map(|item| item.payload.clone()) {
                if inner.resolver.detect_conflict(&local, &remote) {
                    let conflict = ConflictInfo::new(resource, id.clone(), &local, &remote);
                    let resolution = inner.resolver.resolve(&conflict);
                    warn!("Conflict on {} {}: keeping {:?}", resource, id, resolution);
                    inner.bus.emit(
                        names::CONFLICT,
                        json!({ "conflict": conflict, "resolution": resolution }),
                    );
                    if resolution == Resolution::Local {
                        continue;
                    }
                    for item in &pending {
                        inner.store.remove_queue_item(&item.id).await?;
                        self.forget_queued(&item.id);
                    }
                    self.refresh_pending();
                }
            }

            let operation = if Operation::from_payload(&remote) == Operation::Delete {
                Operation::Delete
            } else {
                Operation::Create
            };
            apply_to_collection(&mut collection, operation, &remote);
            applied += 1;
        }

        if applied > 0 && config.enable_offline {
            let record = CachedRecord::new(
                resource,
                Value::Array(collection.clone()),
                inner.registry.business_type().map(|bt| bt.as_str().to_string()),
                previous.as_ref(),
            );
            inner.store.put(record).await?;
            inner.bus.emit(
                names::updated(resource),
                json!({ "resource": resource, "data": collection, "source": "socket" }),
            );
        }
        Ok(applied)
    }

    /// Run one scheduled sync pass.
    pub async fn run_sync(&self, request: SyncRequest) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::default();

        let targets: Vec<String> = match request {
            SyncRequest::Shutdown => return Ok(report),
            SyncRequest::Full => {
                let queue = self.process_sync_queue().await?;
                report.delivered = queue.processed;
                report.retried = queue.retried;
                report.dropped = queue.failed;
                self.due_resources()
            }
            SyncRequest::Resources(names) => names,
        };

        if self.is_online() {
            for name in targets {
                match self.get_data_with_fallback(&name, &FetchOptions::forced()).await {
                    Ok(_) => report.refreshed += 1,
                    Err(e) => {
                        debug!("Refresh of {} failed: {}", name, e);
                        report.refresh_failed += 1;
                    }
                }
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    /// Start a scheduler driving [`run_sync`](Self::run_sync) in the configured mode.
    pub fn start_scheduler(&self) -> SyncScheduler {
        let (scheduler, handle) = SyncScheduler::new(self.inner.config.sync_mode.clone());
        let weak = self.downgrade();
        let task = tokio::spawn(handle.run(move |request| {
            let weak = weak.clone();
            async move {
                match Self::upgrade(&weak) {
                    Some(engine) => engine.run_sync(request).await,
                    None => Err(Error::NotConnected("Sync engine was dropped".to_string())),
                }
            }
        }));
        self.inner.tasks.lock().push(task);
        scheduler
    }

    /// Stop background tasks, drop bus subscriptions and close the push channel.
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        self.inner.wired.lock().clear();
        if let Err(e) = self.inner.push.disconnect().await {
            warn!("Closing push channel failed: {}", e);
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Sync engine shut down");
    }

    fn require(&self, resource: &str) -> Result<ResourceConfig> {
        self.inner.registry.require(resource).map_err(|e| {
            error!("{}", e);
            self.inner.bus.emit(
                names::ERROR,
                json!({ "resource": resource, "error": e.to_string(), "kind": e.kind() }),
            );
            e
        })
    }

    async fn write_through(&self, resource: &str, operation: Operation, item: &Value) -> Result<()> {
        let inner = &self.inner;
        let collection = {
            let _guard = inner.cache_lock.lock().await;
            let previous = inner.store.get(resource).await?;
            let mut items = previous.as_ref().map(CachedRecord::items).unwrap_or_default();
            apply_to_collection(&mut items, operation, item);
            let record = CachedRecord::new(
                resource,
                Value::Array(items.clone()),
                inner.registry.business_type().map(|bt| bt.as_str().to_string()),
                previous.as_ref(),
            );
            inner.store.put(record).await?;
            items
        };

        let change = json!({ "resource": resource, "operation": operation, "data": item });
        match operation {
            Operation::Create => {
                inner.bus.emit(names::created(resource), change);
            }
            Operation::Delete => {
                inner.bus.emit(names::deleted(resource), change);
            }
            Operation::Update | Operation::Read => {}
        }
        inner.bus.emit(
            names::updated(resource),
            json!({ "resource": resource, "data": collection, "source": "local" }),
        );
        Ok(())
    }

    async fn enqueue(&self, resource: &str, operation: Operation, payload: Value) -> Result<()> {
        let item = SyncQueueItem::new(resource, operation, payload, self.inner.config.max_retries);
        self.inner.store.put_queue_item(&item).await?;
        info!("Queued {} {} ({})", operation, resource, item.id);
        self.inner.bus.emit(
            names::QUEUED,
            json!({
                "resource": resource,
                "operation": operation,
                "id": item.id,
                "entityId": item.entity_id(),
            }),
        );
        self.remember_queued(item);
        self.refresh_pending();
        Ok(())
    }

    /// Merge an edit of a not yet delivered create into the queued create,
    /// or drop that create when the record is deleted. Applies only to
    /// records still carrying a temporary id; returns whether it did.
    async fn fold_into_pending_create(
        &self,
        resource: &str,
        operation: Operation,
        stamped: &Value,
    ) -> Result<bool> {
        if !matches!(operation, Operation::Update | Operation::Delete) {
            return Ok(false);
        }
        let Some(entity) = item_id(stamped).filter(|id| is_temp_id(id)) else {
            return Ok(false);
        };
        let Some(mut create) = self
            .pending_for(resource, &entity)
            .into_iter()
            .find(|item| item.operation == Operation::Create)
        else {
            return Ok(false);
        };

        if operation == Operation::Delete {
            self.inner.store.remove_queue_item(&create.id).await?;
            self.forget_queued(&create.id);
            debug!("Dropped queued create {} of deleted {} {}", create.id, resource, entity);
        } else {
            if let (Some(target), Some(patch)) = (create.payload.as_object_mut(), stamped.as_object()) {
                for (key, value) in patch {
                    if key != Operation::FIELD {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            self.inner.store.put_queue_item(&create).await?;
            debug!("Folded update of {} {} into queued create {}", resource, entity, create.id);
            self.remember_queued(create);
        }
        self.refresh_pending();
        Ok(true)
    }

    /// Whether the endpoint for `operation` cannot be resolved yet.
    fn awaits_business_type(&self, config: &ResourceConfig, operation: Operation) -> bool {
        self.inner.registry.business_type().is_none()
            && config
                .endpoints
                .for_operation(operation)
                .is_some_and(|template| template.contains(BUSINESS_TYPE_PLACEHOLDER))
    }

    /// Whether a queued write has to wait for a business type: either its
    /// endpoint needs one, or its resource belongs to a vertical that is not
    /// registered yet.
    fn queued_item_blocked(&self, item: &SyncQueueItem) -> bool {
        if self.inner.registry.business_type().is_some() {
            return false;
        }
        match self.inner.registry.get_resource(&item.resource) {
            Some(config) => self.awaits_business_type(&config, item.operation),
            None => true,
        }
    }

    fn remember_queued(&self, item: SyncQueueItem) {
        let mut queue = self.inner.queue.lock();
        match queue.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => queue.push(item),
        }
    }

    fn forget_queued(&self, id: &str) {
        self.inner.queue.lock().retain(|item| item.id != id);
    }

    fn pending_for(&self, resource: &str, entity_id: &str) -> Vec<SyncQueueItem> {
        self.inner
            .queue
            .lock()
            .iter()
            .filter(|item| item.resource == resource)
            .filter(|item| item.entity_id().as_deref() == Some(entity_id))
            .cloned()
            .collect()
    }

    fn refresh_pending(&self) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for item in self.inner.queue.lock().iter() {
            *counts.entry(item.resource.clone()).or_default() += 1;
        }

        let mut state = self.inner.state.write();
        let mut names: Vec<String> = state.entries().map(|e| e.resource.clone()).collect();
        names.extend(counts.keys().cloned());
        for name in names {
            let pending = counts.get(&name).copied().unwrap_or(0);
            state.entry(&name).set_pending(pending);
        }
    }

    fn due_resources(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        let has_business_type = self.inner.registry.business_type().is_some();
        let state = self.inner.state.read();
        self.inner
            .registry
            .get_all_resources()
            .into_iter()
            .filter(|config| match config.endpoints.get.as_deref() {
                Some(template) => has_business_type || !template.contains(BUSINESS_TYPE_PLACEHOLDER),
                None => false,
            })
            .filter(|config| {
                state
                    .get(&config.name)
                    .map_or(true, |entry| entry.refresh_due(config.sync_interval_ms, now))
            })
            .map(|config| config.name)
            .collect()
    }

    async fn connect_push(&self) {
        let Some(url) = self.inner.config.socket_url.as_deref() else {
            return;
        };
        if self.inner.push.is_connected() {
            return;
        }
        if let Err(e) = self.inner.push.connect(url).await {
            warn!("Push channel unavailable: {}", e);
        }
    }

    /// Listen for `{resource}:changed` and route it through `handle_data_change`.
    fn wire_resource(&self, resource: &str) {
        if !self.inner.wired.lock().insert(resource.to_string()) {
            return;
        }
        let weak = self.downgrade();
        let name = resource.to_string();
        let subscription = self.inner.bus.on(names::changed(resource), move |event| {
            let Some(engine) = Self::upgrade(&weak) else {
                return Ok(());
            };
            let name = name.clone();
            let data = event.data.clone();
            spawn_detached(async move {
                if let Err(e) = engine.handle_data_change(&name, data).await {
                    warn!("Change to {} not delivered: {}", name, e);
                }
            });
            Ok(())
        });
        self.inner.subscriptions.lock().push(subscription);
    }

    fn wire_socket_listener(&self) {
        let weak = self.downgrade();
        let subscription = self.inner.bus.on(names::SOCKET_MESSAGE, move |event| {
            let Some(resource) = event.resource().map(str::to_string) else {
                return Err("push message without a resource".into());
            };
            let Some(engine) = Self::upgrade(&weak) else {
                return Ok(());
            };
            let data = event.data.get("data").cloned().unwrap_or(Value::Null);
            spawn_detached(async move {
                if let Err(e) = engine.apply_remote_update(&resource, &data).await {
                    warn!("Push update for {} not applied: {}", resource, e);
                }
            });
            Ok(())
        });
        self.inner.subscriptions.lock().push(subscription);
    }

    /// Start following the connectivity monitor; returns the current state.
    fn spawn_connectivity_watcher(&self) -> bool {
        let mut rx = self.inner.connectivity.subscribe();
        let online = *rx.borrow_and_update();
        let weak = self.downgrade();

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                if let Err(e) = engine.handle_connectivity_change(online).await {
                    warn!("Connectivity change not fully applied: {}", e);
                }
            }
        });
        self.inner.tasks.lock().push(task);
        online
    }
}

/// Clears the in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a> {
    inner: &'a EngineInner,
}

impl<'a> DrainGuard<'a> {
    fn new(inner: &'a EngineInner) -> Self {
        inner.state.write().sync_in_progress = true;
        Self { inner }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.write().sync_in_progress = false;
        self.inner.sync_in_progress.store(false, Ordering::SeqCst);
    }
}

fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No async runtime available; background sync task dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use bizsync_storage::MemoryStore;
    use bizsync_transport::mock::{MockRealtimeTransport, MockRequestTransport};
    use bizsync_transport::{HttpMethod, RealtimeEvent};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        engine: SyncEngine,
        api: Arc<MockRequestTransport>,
        realtime: Arc<MockRealtimeTransport>,
        store: Arc<MemoryStore>,
        connectivity: Arc<ManualConnectivity>,
    }

    fn harness_with(online: bool, config: EngineConfig) -> Harness {
        let api = Arc::new(MockRequestTransport::new());
        let realtime = Arc::new(MockRealtimeTransport::new());
        let store = Arc::new(MemoryStore::new());
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let engine = SyncEngine::new(
            config,
            EngineComponents {
                bus: EventBus::new(),
                store: store.clone(),
                authenticated: api.clone(),
                public: api.clone(),
                realtime: realtime.clone(),
                connectivity: connectivity.clone(),
            },
        );
        Harness {
            engine,
            api,
            realtime,
            store,
            connectivity,
        }
    }

    async fn harness(online: bool) -> Harness {
        let config = EngineConfig {
            retry: RetryConfig::immediate(),
            ..Default::default()
        };
        let h = harness_with(online, config);
        h.engine.initialize().await.unwrap();
        h.engine
            .set_business_type(BusinessType::new("salon").unwrap());
        h
    }

    fn count(bus: &EventBus, name: &str) -> (Arc<AtomicUsize>, Unsubscribe) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let sub = bus.on(name.to_string(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (counter, sub)
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initialize_seeds_general_resources() {
        let h = harness_with(true, EngineConfig::default());
        let (initialized, _s) = count(h.engine.bus(), names::INITIALIZED);

        h.engine.initialize().await.unwrap();
        h.engine.initialize().await.unwrap();

        assert!(h.engine.registry().has_resource("clients"));
        assert!(h.engine.registry().has_resource("invoices"));
        assert!(h.engine.is_online());
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_business_type_set_emits_once() {
        let h = harness_with(true, EngineConfig::default());
        let (set, _s) = count(h.engine.bus(), names::BUSINESS_TYPE_SET);
        let salon = BusinessType::new("salon").unwrap();

        assert!(h.engine.set_business_type(salon.clone()));
        assert!(!h.engine.set_business_type(salon));
        assert_eq!(set.load(Ordering::SeqCst), 1);
        assert!(h.engine.registry().has_resource("appointments"));
    }

    #[tokio::test]
    async fn test_unregistered_resource_fails_fast() {
        let h = harness(true).await;
        let (errors, _s) = count(h.engine.bus(), names::ERROR);

        let err = h
            .engine
            .handle_data_change("ghost", json!({"_operation": "create"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnregisteredResource(_)));
        assert!(h
            .engine
            .get_data_with_fallback("ghost", &FetchOptions::default())
            .await
            .is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(h.api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_write_is_queued_without_network() {
        let h = harness(false).await;
        let (queued, _s) = count(h.engine.bus(), names::QUEUED);

        let stamped = h
            .engine
            .handle_data_change("clients", json!({"id": "t1", "name": "A", "_operation": "create"}))
            .await
            .unwrap();

        assert_eq!(stamped["_version"], json!(1));
        assert_eq!(h.api.call_count(), 0);
        assert_eq!(queued.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.queued_items().len(), 1);
        assert_eq!(h.store.queue_items().await.unwrap().len(), 1);

        let cached = h.store.get("clients").await.unwrap().unwrap();
        assert_eq!(cached.items()[0]["name"], json!("A"));
    }

    #[tokio::test]
    async fn test_queue_drains_when_connectivity_returns() {
        let h = harness(false).await;
        let (processed, _s) = count(h.engine.bus(), names::QUEUE_PROCESSED);
        h.engine
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .unwrap();

        h.connectivity.set_online(true);
        eventually(|| processed.load(Ordering::SeqCst) == 1).await;

        assert!(h.engine.is_online());
        assert!(h.engine.queued_items().is_empty());
        assert!(h.store.queue_items().await.unwrap().is_empty());
        assert_eq!(h.api.calls_with(HttpMethod::Post).len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_item_fires_single_queue_failed() {
        let h = harness(false).await;
        let (failed, _s) = count(h.engine.bus(), names::QUEUE_FAILED);
        h.engine
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .unwrap();

        h.api.set_failing(true);
        h.engine.handle_connectivity_change(true).await.unwrap();
        let first = h.engine.queued_items();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].retry_count, 1);

        h.engine.process_sync_queue().await.unwrap();
        let report = h.engine.process_sync_queue().await.unwrap();
        assert_eq!(report.failed, 1);

        for _ in 0..3 {
            h.engine.process_sync_queue().await.unwrap();
        }
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(h.engine.queued_items().is_empty());
        assert_eq!(h.api.calls_with(HttpMethod::Post).len(), 3);
    }

    #[tokio::test]
    async fn test_backoff_defers_items() {
        let h = harness_with(true, EngineConfig::default());
        h.engine.initialize().await.unwrap();
        h.engine.set_business_type(BusinessType::new("salon").unwrap());
        h.api.set_failing(true);

        assert!(h
            .engine
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .is_err());
        assert_eq!(h.engine.queued_items().len(), 1);

        let first = h.engine.process_sync_queue().await.unwrap();
        assert_eq!(first.retried, 1);
        let report = h.engine.process_sync_queue().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_online_failure_queues_and_returns_error() {
        let h = harness(true).await;
        h.api.fail_next(1);

        let err = h
            .engine
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.engine.queued_items().len(), 1);
        assert_eq!(
            h.engine.state_snapshot().get("clients").unwrap().status,
            crate::state::SyncStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_online_rejection_is_queued_not_dropped() {
        let h = harness(true).await;
        let retryable = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = retryable.clone();
        let _sub = h.engine.bus().on(names::SYNC_FAILED, move |event| {
            seen.lock().push(event.data["retryable"].clone());
            Ok(())
        });
        h.api.respond_status(HttpMethod::Post, "/api/salon/clients", 401);
        h.api
            .respond(HttpMethod::Post, "/api/salon/clients", json!({"id": "srv-1"}));

        let err = h
            .engine
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(*retryable.lock(), vec![json!(false)]);
        assert_eq!(h.engine.queued_items().len(), 1);
        assert_eq!(h.store.queue_items().await.unwrap().len(), 1);

        let report = h.engine.process_sync_queue().await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(h.store.queue_items().await.unwrap().is_empty());
        assert_eq!(h.api.calls_with(HttpMethod::Post).len(), 2);
    }

    #[tokio::test]
    async fn test_write_before_business_type_waits_without_spending_retries() {
        let h = harness_with(
            true,
            EngineConfig {
                retry: RetryConfig::immediate(),
                ..Default::default()
            },
        );
        h.engine.initialize().await.unwrap();

        h.engine
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .unwrap();
        assert_eq!(h.api.call_count(), 0);

        for _ in 0..5 {
            let report = h.engine.process_sync_queue().await.unwrap();
            assert_eq!(report.deferred, 1);
        }
        let queued = h.store.queue_items().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 0);

        h.engine.set_business_type(BusinessType::new("salon").unwrap());
        eventually(|| h.engine.queued_items().is_empty()).await;
        let posts = h.api.calls_with(HttpMethod::Post);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].path, "/api/salon/clients");
    }

    #[tokio::test]
    async fn test_reloaded_queue_drains_after_business_type_is_set() {
        let h = harness_with(true, EngineConfig::default());
        let client = SyncQueueItem::new(
            "clients",
            Operation::Create,
            json!({"name": "A", "_operation": "create", "_version": 1}),
            3,
        );
        let appointment = SyncQueueItem::new(
            "appointments",
            Operation::Create,
            json!({"clientId": "c1", "_operation": "create", "_version": 1}),
            3,
        );
        h.store.put_queue_item(&client).await.unwrap();
        h.store.put_queue_item(&appointment).await.unwrap();

        h.engine.initialize().await.unwrap();
        assert_eq!(h.engine.queued_items().len(), 2);
        assert!(h
            .store
            .queue_items()
            .await
            .unwrap()
            .iter()
            .all(|item| item.retry_count == 0 && item.last_error.is_none()));
        assert_eq!(h.api.call_count(), 0);

        h.engine.set_business_type(BusinessType::new("salon").unwrap());
        eventually(|| h.engine.queued_items().is_empty()).await;

        let mut paths: Vec<String> = h
            .api
            .calls_with(HttpMethod::Post)
            .into_iter()
            .map(|call| call.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["/api/salon/appointments", "/api/salon/clients"]);
    }

    #[tokio::test]
    async fn test_queue_survives_restart_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockRequestTransport::new());
        let open_engine = |online: bool| {
            SyncEngine::new(
                EngineConfig::default(),
                EngineComponents {
                    bus: EventBus::new(),
                    store: Arc::new(bizsync_storage::LocalFileStore::new(dir.path())),
                    authenticated: api.clone(),
                    public: api.clone(),
                    realtime: Arc::new(MockRealtimeTransport::new()),
                    connectivity: Arc::new(ManualConnectivity::new(online)),
                },
            )
        };
        let salon = BusinessType::new("salon").unwrap();

        let first = open_engine(false);
        first.initialize().await.unwrap();
        first.set_business_type(salon.clone());
        first
            .handle_data_change("clients", json!({"name": "A", "_operation": "create"}))
            .await
            .unwrap();
        first.shutdown().await;
        drop(first);

        let second = open_engine(true);
        second.initialize().await.unwrap();
        assert_eq!(second.queued_items().len(), 1);
        let cached = second.store().get("clients").await.unwrap().unwrap();
        assert_eq!(cached.items()[0]["name"], json!("A"));

        second.set_business_type(salon);
        eventually(|| second.queued_items().is_empty()).await;
        assert!(second.store().queue_items().await.unwrap().is_empty());
        assert_eq!(api.calls_with(HttpMethod::Post).len(), 1);
    }

    #[tokio::test]
    async fn test_edit_of_queued_create_is_folded() {
        let h = harness(false).await;
        let id = bizsync_common::temp_id();
        h.engine
            .handle_data_change("clients", json!({"id": id, "name": "A", "_operation": "create"}))
            .await
            .unwrap();

        h.engine
            .handle_data_change("clients", json!({"id": id, "name": "B", "_operation": "update"}))
            .await
            .unwrap();
        let queued = h.engine.queued_items();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, Operation::Create);
        assert_eq!(queued[0].payload["name"], json!("B"));
        assert_eq!(queued[0].payload[Operation::FIELD], json!("create"));

        h.engine.handle_connectivity_change(true).await.unwrap();
        let posts = h.api.calls_with(HttpMethod::Post);
        assert_eq!(posts.len(), 1);
        assert!(posts[0].body.as_ref().unwrap().get("id").is_none());
        assert!(h.api.calls_with(HttpMethod::Put).is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_queued_create_cancels_it() {
        let h = harness(false).await;
        let id = bizsync_common::temp_id();
        h.engine
            .handle_data_change("clients", json!({"id": id, "name": "A", "_operation": "create"}))
            .await
            .unwrap();
        h.engine
            .handle_data_change("clients", json!({"id": id, "_operation": "delete"}))
            .await
            .unwrap();

        assert!(h.engine.queued_items().is_empty());
        assert!(h.store.get("clients").await.unwrap().unwrap().items().is_empty());
        h.engine.handle_connectivity_change(true).await.unwrap();
        assert_eq!(h.api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dual_delivery_over_api_and_socket() {
        let config = EngineConfig {
            socket_url: Some("ws://push".into()),
            retry: RetryConfig::immediate(),
            ..Default::default()
        };
        let h = harness_with(true, config);
        h.engine.initialize().await.unwrap();
        h.engine.set_business_type(BusinessType::new("salon").unwrap());
        assert!(h.engine.push().is_connected());

        let (synced, _s) = count(h.engine.bus(), names::SYNCED);
        h.engine
            .handle_data_change("clients", json!({"id": "c1", "name": "B"}))
            .await
            .unwrap();

        assert_eq!(h.api.calls_with(HttpMethod::Put).len(), 1);
        let frames = h.realtime.sent_frames();
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], json!("clients:changed"));
        assert_eq!(frame["data"]["operation"], json!("update"));
        assert_eq!(synced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_socket_failure_after_api_success_is_not_fatal() {
        let config = EngineConfig {
            socket_url: Some("ws://push".into()),
            ..Default::default()
        };
        let h = harness_with(true, config);
        h.engine.initialize().await.unwrap();
        h.engine.set_business_type(BusinessType::new("salon").unwrap());
        h.realtime.fail_send(true);

        h.engine
            .handle_data_change("clients", json!({"id": "c1", "name": "B"}))
            .await
            .unwrap();
        assert!(h.engine.queued_items().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_fetches_once_and_persists() {
        let h = harness(true).await;
        h.api.respond(
            HttpMethod::Get,
            "/api/salon/invoices",
            json!([{"id": "i1", "total": 10}]),
        );

        let outcome = h
            .engine
            .get_data_with_fallback("invoices", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.source, DataSource::Network);
        assert_eq!(outcome.data[0]["_version"], json!(1));
        assert_eq!(outcome.data[0]["type"], json!("invoice"));

        let again = h
            .engine
            .get_data_with_fallback("invoices", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(again.source, DataSource::Cache);
        assert_eq!(again.data, outcome.data);
        assert_eq!(h.api.calls_with(HttpMethod::Get).len(), 1);
    }

    #[tokio::test]
    async fn test_offline_read_serves_cache_or_empty() {
        let h = harness(false).await;
        let outcome = h
            .engine
            .get_data_with_fallback("clients", &FetchOptions::forced())
            .await
            .unwrap();
        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.data, json!([]));
        assert_eq!(h.api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_offline_emits_warning() {
        let h = harness(false).await;
        let (stale_events, _s) = count(h.engine.bus(), names::STALE_DATA);
        let mut record = CachedRecord::new("clients", json!([{"id": 1}]), None, None);
        record.sync_timestamp -= 2 * 86_400_000;
        h.store.put(record).await.unwrap();

        let outcome = h
            .engine
            .get_data_with_fallback("clients", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.source, DataSource::Cache);
        assert!(outcome.stale.is_some());
        assert_eq!(stale_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_returned() {
        let h = harness(true).await;
        h.api.set_failing(true);
        let (errors, _s) = count(h.engine.bus(), names::ERROR);
        assert!(h
            .engine
            .get_data_with_fallback("clients", &FetchOptions::default())
            .await
            .is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_fetch_replaces_cache() {
        let h = harness(false).await;
        h.engine
            .handle_data_change("clients", json!({"id": "local-1", "name": "L", "_operation": "create"}))
            .await
            .unwrap();

        // Flip the flag directly so the queue is not drained first.
        h.engine.inner.online.store(true, Ordering::SeqCst);
        h.api
            .respond(HttpMethod::Get, "/api/salon/clients", json!([{"id": "s1"}]));
        let outcome = h
            .engine
            .get_data_with_fallback("clients", &FetchOptions::forced())
            .await
            .unwrap();

        let ids: Vec<String> = outcome
            .data
            .as_array()
            .unwrap()
            .iter()
            .filter_map(item_id)
            .collect();
        assert_eq!(ids, vec!["s1"]);
        assert_eq!(h.engine.queued_items().len(), 1);
        let cached = h.store.get("clients").await.unwrap().unwrap();
        assert_eq!(cached.version, 2);
    }

    #[tokio::test]
    async fn test_remote_update_applied_to_cache() {
        let h = harness(true).await;
        let applied = h
            .engine
            .apply_remote_update("stock", &json!([{"id": "p1", "quantity": 4}]))
            .await
            .unwrap();
        assert_eq!(applied, 1);

        let cached = h.store.get("stock").await.unwrap().unwrap();
        assert_eq!(cached.items()[0]["type"], json!("stock_item"));

        h.engine
            .apply_remote_update("stock", &json!({"id": "p1", "_operation": "delete"}))
            .await
            .unwrap();
        assert!(h.store.get("stock").await.unwrap().unwrap().items().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_remote_wins_discards_pending_write() {
        let h = harness(false).await;
        let (conflicts, _s) = count(h.engine.bus(), names::CONFLICT);
        h.engine
            .handle_data_change("clients", json!({"id": "c1", "name": "local"}))
            .await
            .unwrap();

        let remote = json!({
            "id": "c1",
            "name": "remote",
            "_syncTimestamp": 1,
            "_lastModified": 1,
            "_version": 7,
        });
        assert_eq!(h.engine.apply_remote_update("clients", &remote).await.unwrap(), 1);

        assert_eq!(conflicts.load(Ordering::SeqCst), 1);
        assert!(h.engine.queued_items().is_empty());
        assert!(h.store.queue_items().await.unwrap().is_empty());
        let cached = h.store.get("clients").await.unwrap().unwrap();
        assert_eq!(cached.items()[0]["name"], json!("remote"));
    }

    #[tokio::test]
    async fn test_conflict_local_wins_keeps_pending_write() {
        let h = harness(false).await;
        h.engine
            .handle_data_change("clients", json!({"id": "c1", "name": "local", "_version": 5}))
            .await
            .unwrap();

        let remote = json!({"id": "c1", "name": "remote", "_syncTimestamp": 1, "_lastModified": 1, "_version": 2});
        assert_eq!(h.engine.apply_remote_update("clients", &remote).await.unwrap(), 0);
        assert_eq!(h.engine.queued_items().len(), 1);
    }

    #[tokio::test]
    async fn test_socket_message_reaches_cache() {
        let config = EngineConfig {
            socket_url: Some("ws://push".into()),
            ..Default::default()
        };
        let h = harness_with(true, config);
        h.engine.initialize().await.unwrap();
        h.engine.set_business_type(BusinessType::new("salon").unwrap());

        h.realtime.inject(RealtimeEvent::Message(
            r#"{"type": "services:changed", "resource": "services", "data": [{"id": "s1", "price": "20"}]}"#
                .to_string(),
        ));

        let store = h.store.clone();
        for _ in 0..100 {
            if store.get("services").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let cached = store.get("services").await.unwrap().unwrap();
        assert_eq!(cached.items()[0]["price"], json!(20.0));
    }

    #[tokio::test]
    async fn test_changed_event_routes_to_handle_data_change() {
        let h = harness(true).await;
        let (synced, _s) = count(h.engine.bus(), names::SYNCED);

        h.engine.bus().emit(
            names::changed("clients"),
            json!({"name": "from elsewhere", "_operation": "create"}),
        );
        eventually(|| synced.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.api.calls_with(HttpMethod::Post).len(), 1);
    }

    #[tokio::test]
    async fn test_run_sync_refreshes_due_resources() {
        let h = harness(true).await;
        let report = h.engine.run_sync(SyncRequest::Full).await.unwrap();
        // clients, invoices and the five vertical resources all have get endpoints.
        assert_eq!(report.refreshed, 7);

        let report = h.engine.run_sync(SyncRequest::Full).await.unwrap();
        assert_eq!(report.refreshed, 0);

        let report = h
            .engine
            .run_sync(SyncRequest::Resources(vec!["stock".into()]))
            .await
            .unwrap();
        assert_eq!(report.refreshed, 1);
    }

    #[tokio::test]
    async fn test_scheduler_drives_engine() {
        let h = harness(true).await;
        let scheduler = h.engine.start_scheduler();
        let report = scheduler.request_sync().await.unwrap();
        assert_eq!(report.refreshed, 7);
        scheduler.shutdown().await;
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_error_is_emitted() {
        struct BrokenStore;

        #[async_trait::async_trait]
        impl LocalStore for BrokenStore {
            fn name(&self) -> &str {
                "broken"
            }
            async fn open(&self) -> Result<()> {
                Err(Error::Storage("disk on fire".into()))
            }
            async fn get(&self, _: &str) -> Result<Option<CachedRecord>> {
                Ok(None)
            }
            async fn put(&self, _: CachedRecord) -> Result<()> {
                Ok(())
            }
            async fn delete(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn resources(&self) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
                Ok(Vec::new())
            }
            async fn put_queue_item(&self, _: &SyncQueueItem) -> Result<()> {
                Ok(())
            }
            async fn remove_queue_item(&self, _: &str) -> Result<bool> {
                Ok(false)
            }
        }

        let bus = EventBus::new();
        let (init_errors, _s) = count(&bus, names::INIT_ERROR);
        let api = Arc::new(MockRequestTransport::new());
        let engine = SyncEngine::new(
            EngineConfig::default(),
            EngineComponents {
                bus,
                store: Arc::new(BrokenStore),
                authenticated: api.clone(),
                public: api,
                realtime: Arc::new(MockRealtimeTransport::new()),
                connectivity: Arc::new(ManualConnectivity::new(true)),
            },
        );

        assert!(matches!(engine.initialize().await, Err(Error::Storage(_))));
        assert_eq!(init_errors.load(Ordering::SeqCst), 1);
    }
}
