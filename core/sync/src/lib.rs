//! BizSync sync engine
//!
//! Offline-first orchestration of business resources:
//! - Resource registry with general and per-vertical resources
//! - Payload normalization and sync metadata stamping
//! - Write-through cache with a durable retry queue
//! - Dual delivery over the request API and the push channel
//! - Conflict resolution for pushed updates against pending writes
//! - On-demand and periodic scheduling

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use conflict::{ConflictInfo, ConflictResolver, ConflictStrategy, Resolution};
pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use engine::{
    DataSource, EngineComponents, EngineConfig, FetchOutcome, QueueReport, SyncEngine,
};
pub use processor::{is_data_stale_at, DataProcessor};
pub use registry::{ResourceRegistry, GENERAL_RESOURCES, VERTICAL_RESOURCES};
pub use retry::RetryConfig;
pub use scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{ResourceSyncEntry, SyncState, SyncStatus};
