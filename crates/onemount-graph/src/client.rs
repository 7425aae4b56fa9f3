//! Authenticated HTTP client for the Microsoft Graph API.
//!
//! Wraps `reqwest::Client` with bearer tokens pulled from the
//! [`TokenSource`] port, client-side rate limiting, and the mapping
//! from HTTP statuses to [`RemoteError`] kinds. The client performs no
//! retries of its own; retry policy belongs to the transfer managers.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock, state::direct::NotKeyed, state::InMemoryState, Quota, RateLimiter,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::warn;

use onemount_core::ports::{RemoteError, TokenSource};

/// Base URL for Microsoft Graph API v1.0.
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Default request budget per minute against the Graph API.
const DEFAULT_REQUESTS_PER_MINUTE: u32 = 120;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP client for Graph API calls.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    limiter: DirectLimiter,
}

impl GraphClient {
    /// Creates a client against the production Graph endpoint.
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_base_url(tokens, GRAPH_BASE_URL)
    }

    /// Creates a client with a custom base URL (used by tests to point
    /// at a mock server).
    pub fn with_base_url(tokens: Arc<dyn TokenSource>, base_url: impl Into<String>) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(DEFAULT_REQUESTS_PER_MINUTE).expect("nonzero constant"),
        );
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            limiter: RateLimiter::direct(quota),
        }
    }

    /// The raw HTTP client, for absolute URLs (upload session targets
    /// live on a different host than the API base).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Current bearer token.
    pub async fn bearer_token(&self) -> Result<String, RemoteError> {
        self.tokens.bearer_token().await
    }

    /// Builds an authenticated request against `path` (relative to the
    /// base URL), after waiting for rate-limit clearance.
    pub async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
        self.limiter.until_ready().await;
        let token = self.tokens.bearer_token().await?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Builds an authenticated request against an absolute URL.
    pub async fn request_url(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, RemoteError> {
        self.limiter.until_ready().await;
        let token = self.tokens.bearer_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Sends a request and classifies any failure.
    ///
    /// Success responses pass through untouched for the caller to
    /// consume (JSON, stream, or empty body).
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(classify_status(status, response).await)
    }
}

/// Maps a transport-level failure (connect, timeout, TLS) to a kind.
pub fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Transient(format!("transport failure: {}", e))
}

/// Maps an error status to a [`RemoteError`], consuming the body for
/// the message.
pub async fn classify_status(status: StatusCode, response: Response) -> RemoteError {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read error body".to_string());
    let message = format!("{}: {}", status, truncate(&body, 512));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(message),
        StatusCode::INSUFFICIENT_STORAGE => RemoteError::OutOfSpace(message),
        StatusCode::TOO_MANY_REQUESTS => {
            warn!(retry_after, "graph api rate limited");
            RemoteError::RateLimited {
                retry_after_secs: retry_after,
            }
        }
        s if s.is_server_error() => RemoteError::Transient(message),
        _ => RemoteError::Fatal(message),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemount_core::ports::StaticTokenSource;

    fn client(base: &str) -> GraphClient {
        GraphClient::with_base_url(Arc::new(StaticTokenSource::new("tok")), base)
    }

    #[tokio::test]
    async fn test_request_builds_against_base_url() {
        let c = client("https://example.test/v1.0/");
        let builder = c.request(Method::GET, "/me/drive").await.unwrap();
        let req = builder.build().unwrap();
        assert_eq!(req.url().as_str(), "https://example.test/v1.0/me/drive");
        assert_eq!(
            req.headers()
                .get(reqwest::header::AUTHORIZATION)
                .unwrap()
                .to_str()
                .unwrap(),
            "Bearer tok"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
