//! Access-token sources for the authenticated channel.
//!
//! Token acquisition (login flows, refresh) lives outside this crate; the
//! HTTP transport only asks a [`TokenSource`] for the current bearer token.

use async_trait::async_trait;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use bizsync_common::{Error, Result};

/// Supplies bearer tokens for authenticated requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Get a currently valid access token.
    ///
    /// # Errors
    /// - `Authentication` if no valid token is available
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    /// Create a token source from a raw bearer token.
    ///
    /// # Errors
    /// - Returns error if the token is empty
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::Authentication("Access token cannot be empty".to_string()));
        }
        Ok(Self { token })
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticToken([REDACTED; {} chars])", self.token.len())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let token = StaticToken::new("abc").unwrap();
        assert_eq!(token.access_token().await.unwrap(), "abc");
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(StaticToken::new(" "), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_debug_redacts() {
        let token = StaticToken::new("super-secret").unwrap();
        let printed = format!("{:?}", token);
        assert!(!printed.contains("super-secret"));
    }
}
