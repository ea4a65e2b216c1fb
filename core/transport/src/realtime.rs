//! Persistent push-connection abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use bizsync_common::Result;

/// Something that happened on an open push connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// A text frame from the server.
    Message(String),
    /// The connection closed; no further events follow.
    Closed { reason: Option<String> },
    /// A non-terminal connection error.
    Error(String),
}

/// A bidirectional, server-push capable connection.
///
/// Implementations deliver inbound traffic on the channel returned from
/// `open`; the channel ends after a `Closed` event.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Get the transport name (e.g., "websocket", "mock").
    fn name(&self) -> &str;

    /// Open a connection to `url`.
    async fn open(&self, url: &str) -> Result<mpsc::UnboundedReceiver<RealtimeEvent>>;

    /// Send one text frame.
    ///
    /// # Errors
    /// - `NotConnected` if no connection is open
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the connection if open.
    async fn close(&self) -> Result<()>;
}

/// Outbound push frame: `{type, resource, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub resource: String,
    pub data: Value,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// Inbound push frame: `{type, resource, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub resource: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_uses_type_field() {
        let msg = OutboundMessage {
            kind: "clients:changed".into(),
            resource: "clients".into(),
            data: json!({"id": 1}),
            timestamp: 5,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("clients:changed"));
        assert_eq!(value["timestamp"], json!(5));
    }

    #[test]
    fn test_inbound_tolerates_missing_type() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"resource": "stock", "data": [1, 2]}"#).unwrap();
        assert!(msg.kind.is_none());
        assert_eq!(msg.data, json!([1, 2]));
    }
}
