//! Request/response transport over HTTP.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use bizsync_common::{Error, Operation, Result};

use crate::auth::TokenSource;

/// HTTP verb of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Verb used for an operation.
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Read => HttpMethod::Get,
            Operation::Create => HttpMethod::Post,
            Operation::Update => HttpMethod::Put,
            Operation::Delete => HttpMethod::Delete,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// A resolved request, independent of the HTTP client in use.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path relative to the transport's base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Executes [`ApiRequest`]s against a backend.
///
/// Two instances are used side by side: one that attaches credentials and
/// one that does not. Timeouts are whatever the implementation applies.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Get the transport name (e.g., "http", "mock").
    fn name(&self) -> &str;

    /// Perform the request and return the decoded JSON body.
    ///
    /// An empty success body decodes to `Value::Null`.
    ///
    /// # Errors
    /// - `Transport` for connection failures and unexpected statuses
    /// - `Authentication` for 401, `PermissionDenied` for 403, `NotFound` for 404
    async fn execute(&self, request: ApiRequest) -> Result<Value>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl HttpTransport {
    /// Create an unauthenticated transport for `base_url`.
    ///
    /// # Errors
    /// - `InvalidInput` if the URL does not parse
    /// - `Transport` if the HTTP client cannot be built
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL '{}': {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent(concat!("bizsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            tokens: None,
        })
    }

    /// Attach a bearer token to every request.
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| Error::InvalidInput(format!("Invalid path '{}': {}", path, e)))
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::Transport(format!("Failed to read response: {}", e)))?;
            if body.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&body)
                .map_err(|e| Error::Transport(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound("Resource not found".to_string()))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Authentication("Invalid or expired token".to_string()))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::PermissionDenied("Access denied".to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Transport(format!("API error: {} - {}", status, body)))
        }
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let url = self.url_for(&request.path)?;
        debug!("{} {}", request.method, url);

        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(url),
            HttpMethod::Post => self.http.post(url),
            HttpMethod::Put => self.http.put(url),
            HttpMethod::Delete => self.http.delete(url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if let Some(tokens) = &self.tokens {
            let token = tokens.access_token().await?;
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} {} failed: {}", request.method, request.path, e)))?;

        self.handle_response(response).await
    }
}
