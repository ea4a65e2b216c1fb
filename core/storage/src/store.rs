//! Local store trait definition.

use async_trait::async_trait;

use bizsync_common::{CachedRecord, Result, SyncQueueItem};

/// Durable cache of resource records plus a retry-queue table.
///
/// Implementations must be safe to share between every facade and the
/// orchestrator; a single instance is created per application session.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Prepare the store for use (create directories, load indexes).
    ///
    /// Calling `open` more than once is allowed.
    async fn open(&self) -> Result<()>;

    /// Get the cached record for a resource.
    async fn get(&self, resource: &str) -> Result<Option<CachedRecord>>;

    /// Store a record, replacing whatever was cached for `record.resource`.
    async fn put(&self, record: CachedRecord) -> Result<()>;

    /// Drop the cached record for a resource. Missing records are not an error.
    async fn delete(&self, resource: &str) -> Result<()>;

    /// Names of all resources with a cached record.
    async fn resources(&self) -> Result<Vec<String>>;

    /// All queued writes, oldest first.
    async fn queue_items(&self) -> Result<Vec<SyncQueueItem>>;

    /// Insert a queued write, or update it in place if its id already exists.
    async fn put_queue_item(&self, item: &SyncQueueItem) -> Result<()>;

    /// Remove a queued write. Returns false if it was not present.
    async fn remove_queue_item(&self, id: &str) -> Result<bool>;
}
