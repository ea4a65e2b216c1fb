//! Payload normalization, sync metadata and staleness.

use serde_json::{Map, Value};
use std::sync::Arc;

use bizsync_common::{
    now_millis, CachedRecord, ResourceConfig, ResourceKind, StaleDataWarning, SyncMetadata,
};

use crate::registry::ResourceRegistry;

/// Per-kind shaping applied to each item object after tagging.
type Normalizer = fn(&mut Map<String, Value>);

/// Shapes raw backend payloads and stamps sync metadata.
#[derive(Debug, Clone)]
pub struct DataProcessor {
    registry: Arc<ResourceRegistry>,
}

impl DataProcessor {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }

    /// Normalize a backend response for `resource`.
    ///
    /// Recognized resources get every item tagged with its semantic `type`
    /// and the active `businessType`; a `{"data": [...]}` wrapper is
    /// unwrapped. Anything else passes through unchanged.
    pub fn process_response(&self, resource: &str, raw: Value) -> Value {
        let kind = ResourceKind::from_name(resource);
        let (Some(item_type), Some(normalize)) = (kind.item_type(), normalizer(&kind)) else {
            return raw;
        };
        let business_type = self.registry.business_type();

        let shape = |mut item: Value| {
            if let Some(obj) = item.as_object_mut() {
                obj.insert("type".into(), Value::from(item_type));
                if let Some(bt) = &business_type {
                    obj.insert("businessType".into(), Value::from(bt.as_str()));
                }
                normalize(obj);
            }
            item
        };

        match unwrap_data(raw) {
            Value::Array(items) => Value::Array(items.into_iter().map(shape).collect()),
            Value::Null => Value::Array(Vec::new()),
            single => shape(single),
        }
    }

    /// Stamp sync metadata on a record or on every item of a collection.
    pub fn add_metadata(&self, payload: Value) -> Value {
        stamp(payload, now_millis())
    }

    /// True iff a maximum age is configured and some item is older than it.
    pub fn is_data_stale(&self, data: &Value, config: &ResourceConfig) -> bool {
        is_data_stale_at(data, config, now_millis())
    }

    /// Staleness of a cached record, as a warning value.
    ///
    /// Items without their own `_syncTimestamp` fall back to the record's.
    pub fn check_staleness(
        &self,
        record: &CachedRecord,
        config: &ResourceConfig,
    ) -> Option<StaleDataWarning> {
        let max_age = config.max_offline_age_ms? as i64;
        let oldest = oldest_timestamp(&record.payload).unwrap_or(record.sync_timestamp);
        let age = now_millis() - oldest;
        (age > max_age).then(|| StaleDataWarning {
            resource: record.resource.clone(),
            age_ms: age,
            max_age_ms: max_age,
        })
    }
}

/// [`DataProcessor::is_data_stale`] against an explicit clock.
pub fn is_data_stale_at(data: &Value, config: &ResourceConfig, now: i64) -> bool {
    let Some(max_age) = config.max_offline_age_ms else {
        return false;
    };
    items_of(data)
        .filter_map(|item| item.get(SyncMetadata::SYNC_TIMESTAMP).and_then(Value::as_i64))
        .any(|ts| now - ts > max_age as i64)
}

fn stamp(payload: Value, now: i64) -> Value {
    match payload {
        Value::Array(items) => Value::Array(items.into_iter().map(|i| stamp_item(i, now)).collect()),
        other => stamp_item(other, now),
    }
}

fn stamp_item(mut item: Value, now: i64) -> Value {
    let previous = SyncMetadata::read(&item);
    let meta = SyncMetadata {
        sync_timestamp: now,
        last_modified: previous.map_or(now, |p| p.last_modified.max(now)),
        version: SyncMetadata::version_of(&item) + 1,
    };
    meta.write(&mut item);
    item
}

fn items_of(data: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match data {
        Value::Array(items) => Box::new(items.iter()),
        Value::Object(_) => Box::new(std::iter::once(data)),
        _ => Box::new(std::iter::empty()),
    }
}

fn oldest_timestamp(data: &Value) -> Option<i64> {
    items_of(data)
        .filter_map(|item| item.get(SyncMetadata::SYNC_TIMESTAMP).and_then(Value::as_i64))
        .min()
}

fn unwrap_data(raw: Value) -> Value {
    match raw {
        Value::Object(mut obj) if obj.len() == 1 && obj.get("data").is_some_and(Value::is_array) => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn normalizer(kind: &ResourceKind) -> Option<Normalizer> {
    Some(match kind {
        ResourceKind::Timeline => normalize_timeline,
        ResourceKind::Clients => normalize_client,
        ResourceKind::Invoices => normalize_invoice,
        ResourceKind::Stock => normalize_stock,
        ResourceKind::Sales => normalize_sale,
        ResourceKind::Services => normalize_service,
        ResourceKind::Appointments => normalize_appointment,
        ResourceKind::Unrecognized(_) => return None,
    })
}

fn normalize_timeline(item: &mut Map<String, Value>) {
    if !item.contains_key("date") {
        if let Some(at) = item.get("timestamp").or_else(|| item.get("createdAt")).cloned() {
            item.insert("date".into(), at);
        }
    }
}

fn normalize_client(item: &mut Map<String, Value>) {
    let has_name = item.get("name").and_then(Value::as_str).is_some_and(|n| !n.trim().is_empty());
    if !has_name {
        let first = item.get("firstName").and_then(Value::as_str).unwrap_or_default();
        let last = item.get("lastName").and_then(Value::as_str).unwrap_or_default();
        let full = format!("{} {}", first, last).trim().to_string();
        if !full.is_empty() {
            item.insert("name".into(), Value::from(full));
        }
    }
}

fn normalize_invoice(item: &mut Map<String, Value>) {
    coerce_number(item, "total");
    default_field(item, "status", "draft");
}

fn normalize_stock(item: &mut Map<String, Value>) {
    coerce_number(item, "quantity");
    let quantity = item.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
    let threshold = item.get("minQuantity").and_then(Value::as_f64).unwrap_or(0.0);
    item.insert("lowStock".into(), Value::from(quantity <= threshold));
}

fn normalize_sale(item: &mut Map<String, Value>) {
    coerce_number(item, "total");
}

fn normalize_service(item: &mut Map<String, Value>) {
    coerce_number(item, "price");
    coerce_number(item, "duration");
}

fn normalize_appointment(item: &mut Map<String, Value>) {
    default_field(item, "status", "scheduled");
}

/// Numeric strings such as `"12.50"` become numbers.
fn coerce_number(item: &mut Map<String, Value>, field: &str) {
    let parsed = item
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| s.trim().parse::<f64>().ok());
    if let Some(n) = parsed {
        item.insert(field.into(), Value::from(n));
    }
}

fn default_field(item: &mut Map<String, Value>, field: &str, value: &str) {
    item.entry(field.to_string())
        .or_insert_with(|| Value::from(value));
}
