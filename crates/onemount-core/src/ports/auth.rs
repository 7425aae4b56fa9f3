//! Token source port.
//!
//! Token acquisition and refresh happen outside the core; the engine
//! only ever needs a currently-valid bearer token. The production
//! implementation wraps the OAuth machinery; tests use
//! [`StaticTokenSource`].

use async_trait::async_trait;

use super::remote_store::RemoteError;

/// Yields bearer tokens for remote requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a bearer token valid for at least the next request.
    ///
    /// Implementations refresh internally; a returned error means the
    /// refresh itself failed.
    async fn bearer_token(&self) -> Result<String, RemoteError>;
}

/// Fixed-token source for tests and short-lived tooling.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn bearer_token(&self) -> Result<String, RemoteError> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_source() {
        let src = StaticTokenSource::new("tok-123");
        assert_eq!(src.bearer_token().await.unwrap(), "tok-123");
    }
}
