//! Write envelope handed to both transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bizsync_common::{wire_payload, Operation, SyncMetadata};

/// `{resource, operation, payload, _operation, _syncTimestamp, _lastModified, _version}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEnvelope {
    pub resource: String,
    pub operation: Operation,
    pub payload: Value,
    #[serde(rename = "_operation")]
    pub requested_operation: Operation,
    #[serde(rename = "_syncTimestamp", default)]
    pub sync_timestamp: Option<i64>,
    #[serde(rename = "_lastModified", default)]
    pub last_modified: Option<i64>,
    #[serde(rename = "_version", default)]
    pub version: Option<u64>,
}

impl WriteEnvelope {
    /// Build an envelope from a stamped payload. Temporary ids are not sent.
    pub fn from_payload(resource: impl Into<String>, payload: &Value) -> Self {
        let operation = Operation::from_payload(payload);
        let meta = SyncMetadata::read(payload);
        Self {
            resource: resource.into(),
            operation,
            payload: wire_payload(payload),
            requested_operation: operation,
            sync_timestamp: meta.map(|m| m.sync_timestamp),
            last_modified: meta.map(|m| m.last_modified),
            version: meta.map(|m| m.version),
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing plain data into a Value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_carries_metadata() {
        let payload = json!({
            "id": "c1",
            "_operation": "create",
            "_syncTimestamp": 100,
            "_lastModified": 100,
            "_version": 2
        });
        let envelope = WriteEnvelope::from_payload("clients", &payload).to_value();

        assert_eq!(envelope["resource"], json!("clients"));
        assert_eq!(envelope["operation"], json!("create"));
        assert_eq!(envelope["_operation"], json!("create"));
        assert_eq!(envelope["_version"], json!(2));
        assert_eq!(envelope["payload"]["id"], json!("c1"));
    }

    #[test]
    fn test_unstamped_payload_defaults_to_update() {
        let envelope = WriteEnvelope::from_payload("clients", &json!({"id": 1}));
        assert_eq!(envelope.operation, Operation::Update);
        assert!(envelope.version.is_none());
    }
}
