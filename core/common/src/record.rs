//! Cached records, sync metadata and retry-queue items.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::Operation;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extract an item's id as a string, accepting string or numeric ids.
pub fn item_id(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Prefix of client-assigned ids for creates the server has not answered yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Fresh client-side id for an optimistic create.
pub fn temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Payload as sent to the server: a temporary id stays local.
pub fn wire_payload(item: &Value) -> Value {
    let mut wire = item.clone();
    if let Some(obj) = wire.as_object_mut() {
        if obj.get("id").and_then(Value::as_str).is_some_and(is_temp_id) {
            obj.remove("id");
        }
    }
    wire
}

/// Sync metadata stamped onto payload objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(rename = "_syncTimestamp")]
    pub sync_timestamp: i64,
    #[serde(rename = "_lastModified")]
    pub last_modified: i64,
    #[serde(rename = "_version")]
    pub version: u64,
}

impl SyncMetadata {
    pub const SYNC_TIMESTAMP: &'static str = "_syncTimestamp";
    pub const LAST_MODIFIED: &'static str = "_lastModified";
    pub const VERSION: &'static str = "_version";

    /// Read metadata fields from a payload object, if it was ever stamped.
    pub fn read(item: &Value) -> Option<Self> {
        let obj = item.as_object()?;
        Some(Self {
            sync_timestamp: obj.get(Self::SYNC_TIMESTAMP)?.as_i64()?,
            last_modified: obj
                .get(Self::LAST_MODIFIED)
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            version: obj.get(Self::VERSION).and_then(Value::as_u64).unwrap_or(0),
        })
    }

    /// Version recorded on a payload object, 0 if never stamped.
    pub fn version_of(item: &Value) -> u64 {
        item.get(Self::VERSION).and_then(Value::as_u64).unwrap_or(0)
    }

    /// Write these fields into a payload object. Non-objects are left alone.
    pub fn write(&self, item: &mut Value) {
        if let Some(obj) = item.as_object_mut() {
            obj.insert(Self::SYNC_TIMESTAMP.into(), Value::from(self.sync_timestamp));
            obj.insert(Self::LAST_MODIFIED.into(), Value::from(self.last_modified));
            obj.insert(Self::VERSION.into(), Value::from(self.version));
        }
    }
}

/// A resource's cached payload as held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
    pub resource: String,
    pub payload: Value,
    #[serde(rename = "_syncTimestamp")]
    pub sync_timestamp: i64,
    #[serde(rename = "_lastModified")]
    pub last_modified: i64,
    #[serde(rename = "_version")]
    pub version: u64,
    #[serde(default)]
    pub business_type: Option<String>,
}

impl CachedRecord {
    /// Wrap a payload, advancing the version past `previous`.
    pub fn new(
        resource: impl Into<String>,
        payload: Value,
        business_type: Option<String>,
        previous: Option<&CachedRecord>,
    ) -> Self {
        let now = now_millis();
        let last_modified = previous.map_or(now, |p| p.last_modified.max(now));
        Self {
            resource: resource.into(),
            payload,
            sync_timestamp: now,
            last_modified,
            version: previous.map_or(0, |p| p.version) + 1,
            business_type,
        }
    }

    /// Payload as a list of items; a single object is a one-item list.
    pub fn items(&self) -> Vec<Value> {
        match &self.payload {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.payload {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(obj) => obj.is_empty(),
            _ => false,
        }
    }
}

/// Apply a write to an in-memory collection.
///
/// Create appends (replacing an item with the same id), update shallow-merges
/// into the item with the same id, delete filters it out. Read is a no-op.
pub fn apply_to_collection(items: &mut Vec<Value>, operation: Operation, payload: &Value) {
    let id = item_id(payload);
    match operation {
        Operation::Create => {
            if let Some(id) = &id {
                if let Some(existing) = items.iter_mut().find(|i| item_id(i).as_ref() == Some(id)) {
                    *existing = payload.clone();
                    return;
                }
            }
            items.push(payload.clone());
        }
        Operation::Update => {
            let Some(id) = id else { return };
            if let Some(existing) = items.iter_mut().find(|i| item_id(i).as_ref() == Some(&id)) {
                merge_object(existing, payload);
            }
        }
        Operation::Delete => {
            if let Some(id) = id {
                items.retain(|i| item_id(i).as_ref() != Some(&id));
            }
        }
        Operation::Read => {}
    }
}

fn merge_object(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// A pending write waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    pub resource: String,
    pub operation: Operation,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the drain loop may attempt this item again.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(
        resource: impl Into<String>,
        operation: Operation,
        payload: Value,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            operation,
            payload,
            retry_count: 0,
            max_retries,
            enqueued_at: Utc::now(),
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Record a failed delivery. Returns true once retries are exhausted.
    pub fn record_failure(&mut self, error: impl Into<String>, backoff: Duration) -> bool {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(Utc::now() + backoff);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Id of the entity this write targets, if the payload carries one.
    pub fn entity_id(&self) -> Option<String> {
        item_id(&self.payload)
    }
}

/// Build an empty JSON object.
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_item_id_accepts_numbers_and_strings() {
        assert_eq!(item_id(&json!({"id": "a1"})), Some("a1".into()));
        assert_eq!(item_id(&json!({"id": 42})), Some("42".into()));
        assert_eq!(item_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_wire_payload_drops_only_temporary_ids() {
        let local = json!({"id": temp_id(), "name": "A"});
        assert!(is_temp_id(local["id"].as_str().unwrap()));
        assert_eq!(wire_payload(&local), json!({"name": "A"}));

        let server = json!({"id": "srv-1", "name": "A"});
        assert_eq!(wire_payload(&server), server);
    }

    #[test]
    fn test_metadata_read_write() {
        let mut item = json!({"id": 1});
        assert!(SyncMetadata::read(&item).is_none());

        let meta = SyncMetadata {
            sync_timestamp: 10,
            last_modified: 11,
            version: 2,
        };
        meta.write(&mut item);
        assert_eq!(SyncMetadata::read(&item), Some(meta));
        assert_eq!(SyncMetadata::version_of(&item), 2);
    }

    #[test]
    fn test_cached_record_version_advances() {
        let first = CachedRecord::new("clients", json!([]), None, None);
        assert_eq!(first.version, 1);
        let second = CachedRecord::new("clients", json!([]), None, Some(&first));
        assert_eq!(second.version, 2);
        assert!(second.last_modified >= first.last_modified);
    }

    #[test]
    fn test_cached_record_serializes_metadata_names() {
        let record = CachedRecord::new("clients", json!([]), Some("salon".into()), None);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["_version"], json!(1));
        assert!(value.get("_syncTimestamp").is_some());
        assert_eq!(value["businessType"], json!("salon"));
    }

    #[test]
    fn test_apply_to_collection_operations() {
        let mut items = vec![json!({"id": 1, "name": "a"})];

        apply_to_collection(&mut items, Operation::Create, &json!({"id": 2, "name": "b"}));
        assert_eq!(items.len(), 2);

        apply_to_collection(&mut items, Operation::Update, &json!({"id": 1, "name": "z"}));
        assert_eq!(items[0]["name"], json!("z"));

        apply_to_collection(&mut items, Operation::Delete, &json!({"id": 2}));
        assert_eq!(items, vec![json!({"id": 1, "name": "z"})]);
    }

    #[test]
    fn test_queue_item_exhaustion() {
        let mut item = SyncQueueItem::new("clients", Operation::Create, json!({}), 3);
        assert!(item.is_due(Utc::now()));
        assert!(!item.record_failure("e1", Duration::zero()));
        assert!(!item.record_failure("e2", Duration::zero()));
        assert!(item.record_failure("e3", Duration::zero()));
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.last_error.as_deref(), Some("e3"));
    }

    #[test]
    fn test_queue_item_backoff_not_due() {
        let mut item = SyncQueueItem::new("clients", Operation::Update, json!({}), 3);
        item.record_failure("later", Duration::seconds(60));
        assert!(!item.is_due(Utc::now()));
    }

    proptest! {
        #[test]
        fn prop_delete_removes_every_match(ids in proptest::collection::vec(0u8..8, 0..20), target in 0u8..8) {
            let mut items: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
            apply_to_collection(&mut items, Operation::Delete, &json!({"id": target}));
            prop_assert!(items.iter().all(|i| i["id"] != json!(target)));
        }

        #[test]
        fn prop_update_preserves_length(ids in proptest::collection::vec(0u8..8, 0..20), target in 0u8..8) {
            let mut items: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
            let before = items.len();
            apply_to_collection(&mut items, Operation::Update, &json!({"id": target, "x": true}));
            prop_assert_eq!(items.len(), before);
        }
    }
}
