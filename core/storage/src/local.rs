//! JSON file store on the local filesystem.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::LocalStore;
use bizsync_common::{CachedRecord, Error, Result, SyncQueueItem};

const RECORDS_DIR: &str = "records";
const QUEUE_FILE: &str = "sync_queue.json";

/// Local filesystem store.
///
/// Each resource is cached as `records/<resource>.json`; the retry queue is a
/// single `sync_queue.json` array. Writes go to a temp file first and are
/// renamed into place.
pub struct LocalFileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the queue file.
    queue_lock: Mutex<()>,
}

impl LocalFileStore {
    /// Create a new file store rooted at `root`.
    ///
    /// # Postconditions
    /// - Nothing touches disk until [`LocalStore::open`] is called
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            queue_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, resource: &str) -> PathBuf {
        let encoded = utf8_percent_encode(resource, NON_ALPHANUMERIC).to_string();
        self.root.join(RECORDS_DIR).join(format!("{}.json", encoded))
    }

    fn queue_path(&self) -> PathBuf {
        self.root.join(QUEUE_FILE)
    }

    async fn write_atomic(path: &Path, contents: Vec<u8>) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_queue(&self) -> Result<Vec<SyncQueueItem>> {
        let path = self.queue_path();
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let content = fs::read(&path).await?;
        serde_json::from_slice(&content).map_err(|e| {
            Error::Storage(format!("Corrupt queue file {}: {}", path.display(), e))
        })
    }

    async fn save_queue(&self, items: &[SyncQueueItem]) -> Result<()> {
        let content = serde_json::to_vec_pretty(items)?;
        Self::write_atomic(&self.queue_path(), content).await
    }
}

#[async_trait]
impl LocalStore for LocalFileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn open(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(RECORDS_DIR)).await?;
        debug!("Opened file store at {}", self.root.display());
        Ok(())
    }

    async fn get(&self, resource: &str) -> Result<Option<CachedRecord>> {
        let path = self.record_path(resource);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let content = fs::read(&path).await?;
        match serde_json::from_slice(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A torn cache entry is treated as a miss; the next fetch rewrites it.
                warn!("Discarding unreadable cache entry for {}: {}", resource, e);
                Ok(None)
            }
        }
    }

    async fn put(&self, record: CachedRecord) -> Result<()> {
        let content = serde_json::to_vec(&record)?;
        Self::write_atomic(&self.record_path(&record.resource), content).await
    }

    async fn delete(&self, resource: &str) -> Result<()> {
        match fs::remove_file(self.record_path(resource)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn resources(&self) -> Result<Vec<String>> {
        let dir = self.root.join(RECORDS_DIR);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            names.push(percent_decode_str(stem).decode_utf8_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
        let _guard = self.queue_lock.lock().await;
        self.load_queue().await
    }

    async fn put_queue_item(&self, item: &SyncQueueItem) -> Result<()> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.load_queue().await?;
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        self.save_queue(&items).await
    }

    async fn remove_queue_item(&self, id: &str) -> Result<bool> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.load_queue().await?;
        let before = items.len();
        items.retain(|item| item.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.save_queue(&items).await?;
        Ok(true)
    }
}
