//! Application-wide sync context.
//!
//! One [`SyncContext`] is built at startup and handed to whatever needs
//! resource handles; there is no process-global engine.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use bizsync_common::{BusinessType, Result};
use bizsync_events::EventBus;
use bizsync_storage::LocalFileStore;
use bizsync_sync::{EngineComponents, EngineConfig, ManualConnectivity, SyncEngine};
use bizsync_transport::{HttpTransport, StaticToken, WebSocketTransport};

use crate::facade::ResourceHandle;
use crate::strategy::{RuleStrategy, Strategy};

/// Inputs for a context talking to a live backend.
#[derive(Clone)]
pub struct ContextOptions {
    pub engine: EngineConfig,
    /// Directory of the file-backed local store.
    pub data_dir: PathBuf,
    /// Bearer token for the authenticated channel.
    pub token: Option<String>,
}

/// Owns the engine, the connectivity switch and the active strategy.
pub struct SyncContext {
    engine: SyncEngine,
    connectivity: Arc<ManualConnectivity>,
    strategy: Arc<dyn Strategy>,
}

impl SyncContext {
    /// Wrap an already built engine.
    pub fn new(
        engine: SyncEngine,
        connectivity: Arc<ManualConnectivity>,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        Self {
            engine,
            connectivity,
            strategy,
        }
    }

    /// Build a context over HTTP, WebSocket and a file store.
    ///
    /// Without a token the authenticated channel sends no credentials and
    /// the server decides.
    ///
    /// # Errors
    /// - `InvalidInput` if the API base URL does not parse
    /// - `Authentication` if the token is empty
    pub fn connect(options: ContextOptions) -> Result<Self> {
        let public = HttpTransport::new(&options.engine.api_base_url)?;
        let mut authenticated = HttpTransport::new(&options.engine.api_base_url)?;
        if let Some(token) = options.token {
            authenticated = authenticated.with_token_source(Arc::new(StaticToken::new(token)?));
        }

        let connectivity = Arc::new(ManualConnectivity::new(true));
        let engine = SyncEngine::new(
            options.engine,
            EngineComponents {
                bus: EventBus::new(),
                store: Arc::new(LocalFileStore::new(&options.data_dir)),
                authenticated: Arc::new(authenticated),
                public: Arc::new(public),
                realtime: Arc::new(WebSocketTransport::new()),
                connectivity: connectivity.clone(),
            },
        );

        info!("Sync context using {}", options.data_dir.display());
        Ok(Self::new(
            engine,
            connectivity,
            Arc::new(RuleStrategy::standard("default")),
        ))
    }

    pub async fn initialize(&self) -> Result<()> {
        self.engine.initialize().await
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn bus(&self) -> &EventBus {
        self.engine.bus()
    }

    pub fn strategy(&self) -> Arc<dyn Strategy> {
        self.strategy.clone()
    }

    /// Replace the strategy used by handles created from now on.
    pub fn set_strategy(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategy = strategy;
    }

    /// Activate a business vertical on the engine.
    pub fn set_business_type(&self, business_type: BusinessType) -> bool {
        self.engine.set_business_type(business_type)
    }

    /// Report a platform connectivity change.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Mount a handle for `resource` with the active strategy.
    pub async fn resource(&self, resource: &str) -> ResourceHandle {
        ResourceHandle::mount(self.engine.clone(), resource, self.strategy.clone()).await
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
