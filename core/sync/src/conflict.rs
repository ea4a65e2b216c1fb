//! Conflict detection and resolution between queued writes and pushed updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use bizsync_common::SyncMetadata;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Higher `_version` wins, then later `_lastModified`; remote wins a full tie.
    #[default]
    LastWriteWins,
    /// Keep the pending local write.
    PreferLocal,
    /// Take the pushed update and drop the pending write.
    PreferRemote,
}

/// Which side of a conflict is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
}

/// A detected conflict on one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub resource: String,
    pub entity_id: String,
    pub local: Option<SyncMetadata>,
    pub remote: Option<SyncMetadata>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn new(
        resource: impl Into<String>,
        entity_id: impl Into<String>,
        local: &Value,
        remote: &Value,
    ) -> Self {
        Self {
            resource: resource.into(),
            entity_id: entity_id.into(),
            local: SyncMetadata::read(local),
            remote: SyncMetadata::read(remote),
            detected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Two stamped payloads conflict when their metadata differs.
    pub fn detect_conflict(&self, local: &Value, remote: &Value) -> bool {
        match (SyncMetadata::read(local), SyncMetadata::read(remote)) {
            (Some(l), Some(r)) => l.version != r.version || l.last_modified != r.last_modified,
            // An unstamped side cannot be ordered; treat any pending write as conflicting.
            _ => true,
        }
    }

    pub fn resolve(&self, conflict: &ConflictInfo) -> Resolution {
        match self.strategy {
            ConflictStrategy::PreferLocal => Resolution::Local,
            ConflictStrategy::PreferRemote => Resolution::Remote,
            ConflictStrategy::LastWriteWins => last_write_wins(conflict.local, conflict.remote),
        }
    }
}

fn last_write_wins(local: Option<SyncMetadata>, remote: Option<SyncMetadata>) -> Resolution {
    match (local, remote) {
        (Some(l), Some(r)) => {
            if l.version != r.version {
                if l.version > r.version {
                    Resolution::Local
                } else {
                    Resolution::Remote
                }
            } else if l.last_modified > r.last_modified {
                Resolution::Local
            } else {
                Resolution::Remote
            }
        }
        (Some(_), None) => Resolution::Local,
        _ => Resolution::Remote,
    }
}
