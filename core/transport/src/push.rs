//! Push-connection adapter.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bizsync_common::{now_millis, Error, ResourceConfig, Result};
use bizsync_events::{names, EventBus};

use crate::realtime::{InboundMessage, OutboundMessage, RealtimeEvent, RealtimeTransport};

/// Keeps one push connection open and bridges it onto the event bus.
///
/// Inbound `{type, resource, data}` frames are republished as
/// `{resource}:socket-update` and `datasync:socket-message`.
#[derive(Clone)]
pub struct PushAdapter {
    transport: Arc<dyn RealtimeTransport>,
    bus: EventBus,
    connected: Arc<AtomicBool>,
    url: Arc<Mutex<Option<String>>>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PushAdapter {
    pub fn new(transport: Arc<dyn RealtimeTransport>, bus: EventBus) -> Self {
        Self {
            transport,
            bus,
            connected: Arc::new(AtomicBool::new(false)),
            url: Arc::new(Mutex::new(None)),
            pump: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the connection and start forwarding inbound traffic.
    ///
    /// # Errors
    /// - Whatever the transport returns from `open`; `socket-error` is emitted first
    pub async fn connect(&self, url: &str) -> Result<()> {
        let rx = match self.transport.open(url).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Push connection to {} failed: {}", url, e);
                self.bus.emit(
                    names::SOCKET_ERROR,
                    json!({ "url": url, "error": e.to_string() }),
                );
                return Err(e);
            }
        };

        *self.url.lock() = Some(url.to_string());
        self.connected.store(true, Ordering::SeqCst);
        info!("Push connection open: {}", url);
        self.bus.emit(names::SOCKET_CONNECTED, json!({ "url": url }));

        let adapter = self.clone();
        let handle = tokio::spawn(async move { adapter.pump(rx).await });
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn pump(&self, mut rx: mpsc::UnboundedReceiver<RealtimeEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        // Transport dropped its sender without a Closed event.
        if self.connected.swap(false, Ordering::SeqCst) {
            self.bus
                .emit(names::SOCKET_DISCONNECTED, json!({ "reason": "channel closed" }));
        }
    }

    /// Apply one connection event: republish messages, track open/closed.
    pub fn handle_event(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Message(text) => self.handle_message(&text),
            RealtimeEvent::Closed { reason } => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!("Push connection closed: {:?}", reason);
                    self.bus
                        .emit(names::SOCKET_DISCONNECTED, json!({ "reason": reason }));
                }
            }
            RealtimeEvent::Error(message) => {
                warn!("Push connection error: {}", message);
                self.bus.emit(names::SOCKET_ERROR, json!({ "error": message }));
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed push frame: {}", e);
                self.bus.emit(
                    names::SOCKET_ERROR,
                    json!({ "error": format!("malformed frame: {}", e) }),
                );
                return;
            }
        };

        debug!("Push message for {}", message.resource);
        let payload = json!({
            "type": message.kind,
            "resource": message.resource,
            "data": message.data,
        });
        self.bus
            .emit(names::socket_update(&message.resource), payload.clone());
        self.bus.emit(names::SOCKET_MESSAGE, payload);
    }

    /// Send a write over the push connection.
    ///
    /// # Errors
    /// - `NotConnected` if the connection is not open
    /// - `InvalidInput` if the resource declares no push events
    pub async fn sync_via_socket(
        &self,
        resource: &str,
        data: &Value,
        config: &ResourceConfig,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected(format!(
                "Cannot push '{}': connection is not open",
                resource
            )));
        }

        let kind = config.primary_push_event().ok_or_else(|| {
            Error::InvalidInput(format!("Resource '{}' declares no push events", resource))
        })?;

        let frame = serde_json::to_string(&OutboundMessage {
            kind: kind.to_string(),
            resource: resource.to_string(),
            data: data.clone(),
            timestamp: now_millis(),
        })?;

        self.transport.send(frame).await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// URL of the current (or last) connection.
    pub fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    /// Close the connection and stop the pump.
    pub async fn disconnect(&self) -> Result<()> {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.transport.close().await?;
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Push connection closed by client");
            self.bus
                .emit(names::SOCKET_DISCONNECTED, json!({ "reason": "client disconnect" }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRealtimeTransport;
    use std::time::Duration;

    fn adapter() -> (Arc<MockRealtimeTransport>, EventBus, PushAdapter) {
        let transport = Arc::new(MockRealtimeTransport::new());
        let bus = EventBus::new();
        let adapter = PushAdapter::new(transport.clone(), bus.clone());
        (transport, bus, adapter)
    }

    fn clients_config() -> ResourceConfig {
        ResourceConfig::new("clients").with_push_events(vec!["clients:changed".into()])
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (_transport, _bus, adapter) = adapter();
        let err = adapter
            .sync_via_socket("clients", &json!({}), &clients_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_connect_and_send_frame() {
        let (transport, bus, adapter) = adapter();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.on(names::SOCKET_CONNECTED, move |e| {
            let _ = tx.send(e.data.clone());
            Ok(())
        });

        adapter.connect("ws://test/socket").await.unwrap();
        assert!(adapter.is_connected());
        assert_eq!(rx.recv().await.unwrap()["url"], json!("ws://test/socket"));

        adapter
            .sync_via_socket("clients", &json!({"id": 1}), &clients_config())
            .await
            .unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["type"], json!("clients:changed"));
        assert_eq!(frame["resource"], json!("clients"));
        assert_eq!(frame["data"]["id"], json!(1));
        assert!(frame["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_resource_without_push_events_is_rejected() {
        let (_transport, _bus, adapter) = adapter();
        adapter.connect("ws://test").await.unwrap();
        let err = adapter
            .sync_via_socket("clients", &json!({}), &ResourceConfig::new("clients"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_inbound_message_is_republished() {
        let (transport, bus, adapter) = adapter();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx2 = tx.clone();
        let _a = bus.on(names::socket_update("stock"), move |e| {
            let _ = tx.send(("update", e.data.clone()));
            Ok(())
        });
        let _b = bus.on(names::SOCKET_MESSAGE, move |e| {
            let _ = tx2.send(("message", e.data.clone()));
            Ok(())
        });

        adapter.connect("ws://test").await.unwrap();
        transport.inject(RealtimeEvent::Message(
            r#"{"type": "stock:changed", "resource": "stock", "data": {"id": 3}}"#.to_string(),
        ));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.0, "update");
        assert_eq!(first.1["data"]["id"], json!(3));
        assert_eq!(second.0, "message");
        assert_eq!(second.1["resource"], json!("stock"));
    }

    #[tokio::test]
    async fn test_close_event_marks_disconnected_once() {
        let (_transport, bus, adapter) = adapter();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.on(names::SOCKET_DISCONNECTED, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        adapter.connect("ws://test").await.unwrap();
        adapter.handle_event(RealtimeEvent::Closed { reason: Some("bye".into()) });
        adapter.handle_event(RealtimeEvent::Closed { reason: None });

        assert!(!adapter.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_emits_socket_error() {
        let (_transport, bus, adapter) = adapter();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.on(names::SOCKET_ERROR, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        adapter.handle_event(RealtimeEvent::Message("not json".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_open_emits_error() {
        let (transport, bus, adapter) = adapter();
        transport.fail_open(true);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.on(names::SOCKET_ERROR, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(adapter.connect("ws://test").await.is_err());
        assert!(!adapter.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (transport, _bus, adapter) = adapter();
        adapter.connect("ws://test").await.unwrap();
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
        assert!(transport.is_closed());
    }
}
