//! Deterministic transport doubles.
//!
//! Both doubles keep everything in memory and never touch the network, so
//! engine and facade behaviour can be driven step by step from tests and
//! from embedding applications running without a backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use bizsync_common::{Error, Result};

use crate::http::{ApiRequest, HttpMethod, RequestTransport};
use crate::realtime::{RealtimeEvent, RealtimeTransport};

#[derive(Clone)]
enum Scripted {
    Body(Value),
    Failure(String),
    Status(u16),
}

/// Scripted [`RequestTransport`].
///
/// Responses are queued per `(method, path)`; the last queued response is
/// sticky. Unrouted GETs return `[]`, other unrouted calls return `null`.
#[derive(Default)]
pub struct MockRequestTransport {
    routes: Mutex<HashMap<(HttpMethod, String), VecDeque<Scripted>>>,
    calls: Mutex<Vec<ApiRequest>>,
    fail_next: AtomicUsize,
    failing: AtomicBool,
}

impl MockRequestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn respond(&self, method: HttpMethod, path: impl Into<String>, body: Value) {
        self.routes
            .lock()
            .entry((method, path.into()))
            .or_default()
            .push_back(Scripted::Body(body));
    }

    /// Queue a failure (surfaced as `Error::Transport`).
    pub fn respond_error(&self, method: HttpMethod, path: impl Into<String>, message: impl Into<String>) {
        self.routes
            .lock()
            .entry((method, path.into()))
            .or_default()
            .push_back(Scripted::Failure(message.into()));
    }

    /// Queue an HTTP error status, surfaced the way [`HttpTransport`] maps it.
    ///
    /// [`HttpTransport`]: crate::http::HttpTransport
    pub fn respond_status(&self, method: HttpMethod, path: impl Into<String>, status: u16) {
        self.routes
            .lock()
            .entry((method, path.into()))
            .or_default()
            .push_back(Scripted::Status(status));
    }

    /// Fail the next `n` calls regardless of route.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls with the given method.
    pub fn calls_with(&self, method: HttpMethod) -> Vec<ApiRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn take_forced_failure(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn scripted(&self, method: HttpMethod, path: &str) -> Option<Scripted> {
        let mut routes = self.routes.lock();
        let queue = routes.get_mut(&(method, path.to_string()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl RequestTransport for MockRequestTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let method = request.method;
        let path = request.path.clone();
        self.calls.lock().push(request);

        if self.take_forced_failure() {
            return Err(Error::Transport(format!("{} {}: simulated failure", method, path)));
        }

        match self.scripted(method, &path) {
            Some(Scripted::Body(body)) => Ok(body),
            Some(Scripted::Failure(message)) => Err(Error::Transport(message)),
            Some(Scripted::Status(status)) => Err(status_error(status)),
            None if method == HttpMethod::Get => Ok(Value::Array(Vec::new())),
            None => Ok(Value::Null),
        }
    }
}

fn status_error(status: u16) -> Error {
    match status {
        401 => Error::Authentication("Invalid or expired token".to_string()),
        403 => Error::PermissionDenied("Access denied".to_string()),
        404 => Error::NotFound("Resource not found".to_string()),
        other => Error::Transport(format!("API error: {}", other)),
    }
}

/// In-memory [`RealtimeTransport`].
///
/// `inject` pushes events into the open connection; sent frames are kept for
/// inspection.
#[derive(Default)]
pub struct MockRealtimeTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<RealtimeEvent>>>,
    sent: Mutex<Vec<String>>,
    opened: Mutex<Vec<String>>,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    closed: AtomicBool,
}

impl MockRealtimeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event on the open connection. Returns false if none is open.
    pub fn inject(&self, event: RealtimeEvent) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self, reason: impl Into<String>) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(RealtimeEvent::Closed {
                reason: Some(reason.into()),
            });
        }
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeTransport for MockRealtimeTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, url: &str) -> Result<mpsc::UnboundedReceiver<RealtimeEvent>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("{}: simulated connect failure", url)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        self.opened.lock().push(url.to_string());
        self.closed.store(false, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(&self, frame: String) -> Result<()> {
        if self.sender.lock().is_none() {
            return Err(Error::NotConnected("mock connection is not open".into()));
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::Transport("simulated send failure".into()));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.sender.lock().take();
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_last_response_is_sticky() {
        let mock = MockRequestTransport::new();
        mock.respond(HttpMethod::Get, "/a", json!(1));
        mock.respond(HttpMethod::Get, "/a", json!(2));

        for expected in [1, 2, 2] {
            let body = mock
                .execute(ApiRequest::new(HttpMethod::Get, "/a"))
                .await
                .unwrap();
            assert_eq!(body, json!(expected));
        }
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unrouted_defaults() {
        let mock = MockRequestTransport::new();
        assert_eq!(
            mock.execute(ApiRequest::new(HttpMethod::Get, "/x")).await.unwrap(),
            json!([])
        );
        assert_eq!(
            mock.execute(ApiRequest::new(HttpMethod::Post, "/x")).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let mock = MockRequestTransport::new();
        mock.respond_error(HttpMethod::Put, "/x/1", "boom");
        let err = mock
            .execute(ApiRequest::new(HttpMethod::Put, "/x/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(m) if m == "boom"));
    }

    #[tokio::test]
    async fn test_scripted_status_maps_like_http() {
        let mock = MockRequestTransport::new();
        mock.respond_status(HttpMethod::Post, "/x", 401);
        mock.respond_status(HttpMethod::Post, "/x", 404);

        let first = mock.execute(ApiRequest::new(HttpMethod::Post, "/x")).await;
        assert!(matches!(first, Err(Error::Authentication(_))));
        let second = mock.execute(ApiRequest::new(HttpMethod::Post, "/x")).await;
        assert!(matches!(second, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let mock = MockRequestTransport::new();
        mock.fail_next(2);
        for _ in 0..2 {
            assert!(mock.execute(ApiRequest::new(HttpMethod::Get, "/")).await.is_err());
        }
        assert!(mock.execute(ApiRequest::new(HttpMethod::Get, "/")).await.is_ok());
    }

    #[tokio::test]
    async fn test_realtime_inject_and_send() {
        let mock = MockRealtimeTransport::new();
        assert!(!mock.inject(RealtimeEvent::Message("early".into())));
        assert!(mock.send("x".into()).await.is_err());

        let mut rx = mock.open("ws://test").await.unwrap();
        assert!(mock.inject(RealtimeEvent::Message("hello".into())));
        assert_eq!(rx.recv().await, Some(RealtimeEvent::Message("hello".into())));

        mock.send("frame".into()).await.unwrap();
        assert_eq!(mock.sent_frames(), vec!["frame".to_string()]);
        assert_eq!(mock.opened_urls(), vec!["ws://test".to_string()]);

        mock.drop_connection("gone");
        assert!(matches!(rx.recv().await, Some(RealtimeEvent::Closed { .. })));
        assert_eq!(rx.recv().await, None);
    }
}
