//! Delivery mechanisms for bizsync.
//!
//! Two independent transports are consumed by the orchestrator:
//! - a request/response adapter ([`RestAdapter`]) over a pluggable
//!   [`RequestTransport`], with separate authenticated and public channels
//! - a persistent push-connection adapter ([`PushAdapter`]) over a pluggable
//!   [`RealtimeTransport`]
//!
//! Concrete implementations are provided for HTTP (reqwest) and WebSocket
//! (tokio-tungstenite); [`mock`] holds deterministic doubles for tests.

pub mod auth;
pub mod endpoint;
pub mod envelope;
pub mod http;
pub mod mock;
pub mod push;
pub mod realtime;
pub mod rest;
pub mod ws;

pub use auth::{StaticToken, TokenSource};
pub use endpoint::resolve_endpoint;
pub use envelope::WriteEnvelope;
pub use http::{ApiRequest, HttpMethod, HttpTransport, RequestTransport};
pub use push::PushAdapter;
pub use realtime::{InboundMessage, OutboundMessage, RealtimeEvent, RealtimeTransport};
pub use rest::{FetchOptions, RestAdapter};
pub use ws::WebSocketTransport;
