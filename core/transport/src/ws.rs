//! WebSocket push transport.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use bizsync_common::{Error, Result};

use crate::realtime::{RealtimeEvent, RealtimeTransport};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// [`RealtimeTransport`] over a single WebSocket connection.
#[derive(Default)]
pub struct WebSocketTransport {
    sink: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn open(&self, url: &str) -> Result<mpsc::UnboundedReceiver<RealtimeEvent>> {
        self.close().await?;

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("WebSocket connect to {} failed: {}", url, e)))?;
        info!("WebSocket connected to {}", url);

        let (sink, mut source) = stream.split();
        *self.sink.lock().await = Some(sink);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => RealtimeEvent::Message(text.to_string()),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => RealtimeEvent::Message(text),
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = tx.send(RealtimeEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(RealtimeEvent::Error(e.to_string()));
                        let _ = tx.send(RealtimeEvent::Closed { reason: None });
                        return;
                    }
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            let _ = tx.send(RealtimeEvent::Closed { reason: None });
        });
        *self.reader.lock().await = Some(handle);

        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| Error::NotConnected("WebSocket is not open".to_string()))?;
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            // The peer may already be gone; closing is best effort.
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let transport = WebSocketTransport::new();
        let err = transport.send("{}".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_open_unreachable_fails() {
        let transport = WebSocketTransport::new();
        let err = transport.open("ws://127.0.0.1:9/socket").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = WebSocketTransport::new();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
