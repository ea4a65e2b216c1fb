//! In-memory store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::store::LocalStore;
use bizsync_common::{CachedRecord, Result, SyncQueueItem};

/// In-memory local store.
///
/// Useful for testing and for sessions that must not touch disk. All data
/// is lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, CachedRecord>>,
    queue: RwLock<Vec<SyncQueueItem>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, resource: &str) -> Result<Option<CachedRecord>> {
        Ok(self.records.read().await.get(resource).cloned())
    }

    async fn put(&self, record: CachedRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.resource.clone(), record);
        Ok(())
    }

    async fn delete(&self, resource: &str) -> Result<()> {
        self.records.write().await.remove(resource);
        Ok(())
    }

    async fn resources(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
        Ok(self.queue.read().await.clone())
    }

    async fn put_queue_item(&self, item: &SyncQueueItem) -> Result<()> {
        let mut queue = self.queue.write().await;
        match queue.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => queue.push(item.clone()),
        }
        Ok(())
    }

    async fn remove_queue_item(&self, id: &str) -> Result<bool> {
        let mut queue = self.queue.write().await;
        let before = queue.len();
        queue.retain(|item| item.id != id);
        Ok(queue.len() != before)
    }
}
