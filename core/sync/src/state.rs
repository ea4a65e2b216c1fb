//! Per-resource sync state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use bizsync_common::{Error, Result};

/// Sync status for a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing has happened yet.
    Idle,
    /// A delivery is in flight.
    Syncing,
    /// Last delivery or fetch succeeded.
    Synced,
    /// Writes are waiting in the retry queue.
    Queued,
    /// Last delivery failed.
    Failed,
}

/// Sync bookkeeping for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncEntry {
    pub resource: String,
    pub status: SyncStatus,
    /// Last successful network read.
    pub last_fetched: Option<DateTime<Utc>>,
    /// Last successful delivery.
    pub last_synced: Option<DateTime<Utc>>,
    /// Consecutive failed deliveries.
    pub failure_count: u32,
    pub last_error: Option<String>,
    /// Writes for this resource currently in the queue.
    pub pending: usize,
}

impl ResourceSyncEntry {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            status: SyncStatus::Idle,
            last_fetched: None,
            last_synced: None,
            failure_count: 0,
            last_error: None,
            pending: 0,
        }
    }

    pub fn mark_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
    }

    pub fn mark_synced(&mut self) {
        self.status = if self.pending > 0 {
            SyncStatus::Queued
        } else {
            SyncStatus::Synced
        };
        self.last_synced = Some(Utc::now());
        self.failure_count = 0;
        self.last_error = None;
    }

    pub fn mark_fetched(&mut self) {
        self.last_fetched = Some(Utc::now());
        if matches!(self.status, SyncStatus::Idle | SyncStatus::Syncing) {
            self.status = SyncStatus::Synced;
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Failed;
        self.failure_count += 1;
        self.last_error = Some(error.into());
    }

    pub fn set_pending(&mut self, pending: usize) {
        self.pending = pending;
        if pending > 0 && self.status != SyncStatus::Failed {
            self.status = SyncStatus::Queued;
        } else if pending == 0 && self.status == SyncStatus::Queued {
            self.status = SyncStatus::Synced;
        }
    }

    /// Whether a periodic refresh is due for a resource syncing every `interval_ms`.
    pub fn refresh_due(&self, interval_ms: u64, now: DateTime<Utc>) -> bool {
        match self.last_fetched {
            None => true,
            Some(at) => (now - at).num_milliseconds() >= interval_ms as i64,
        }
    }
}

/// Overall sync state of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    entries: BTreeMap<String, ResourceSyncEntry>,
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub last_queue_drain: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str) -> Option<&ResourceSyncEntry> {
        self.entries.get(resource)
    }

    /// Entry for `resource`, created idle on first use.
    pub fn entry(&mut self, resource: &str) -> &mut ResourceSyncEntry {
        self.entries
            .entry(resource.to_string())
            .or_insert_with(|| ResourceSyncEntry::new(resource))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ResourceSyncEntry> {
        self.entries.values()
    }

    pub fn count_by_status(&self) -> HashMap<SyncStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn has_pending_changes(&self) -> bool {
        self.entries.values().any(|e| e.pending > 0)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entry_lifecycle() {
        let mut entry = ResourceSyncEntry::new("clients");
        assert_eq!(entry.status, SyncStatus::Idle);

        entry.mark_syncing();
        entry.mark_failed("timeout");
        assert_eq!(entry.status, SyncStatus::Failed);
        assert_eq!(entry.failure_count, 1);

        entry.mark_synced();
        assert_eq!(entry.status, SyncStatus::Synced);
        assert_eq!(entry.failure_count, 0);
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_pending_writes_keep_entry_queued() {
        let mut entry = ResourceSyncEntry::new("clients");
        entry.set_pending(2);
        assert_eq!(entry.status, SyncStatus::Queued);

        entry.mark_synced();
        assert_eq!(entry.status, SyncStatus::Queued);

        entry.set_pending(0);
        assert_eq!(entry.status, SyncStatus::Synced);
    }

    #[test]
    fn test_refresh_due() {
        let mut entry = ResourceSyncEntry::new("stock");
        let now = Utc::now();
        assert!(entry.refresh_due(30_000, now));

        entry.last_fetched = Some(now - Duration::seconds(10));
        assert!(!entry.refresh_due(30_000, now));
        assert!(entry.refresh_due(10_000, now));
    }

    #[test]
    fn test_state_serialization() {
        let mut state = SyncState::new();
        state.entry("clients").set_pending(1);
        state.entry("invoices").mark_fetched();
        state.is_online = true;

        assert!(state.has_pending_changes());
        let counts = state.count_by_status();
        assert_eq!(counts.get(&SyncStatus::Queued), Some(&1));
        assert_eq!(counts.get(&SyncStatus::Synced), Some(&1));

        let json = state.to_json().unwrap();
        assert!(json.contains("\"isOnline\": true"));
        let restored = SyncState::from_json(&json).unwrap();
        assert_eq!(restored.entries().count(), 2);
        assert_eq!(restored.get("clients").unwrap().pending, 1);
    }
}
