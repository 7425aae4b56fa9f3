//! Change-notification webhooks.
//!
//! Two halves:
//!
//! - Subscription lifecycle against the Graph API: create with a
//!   `clientState` secret, renew before expiration, delete on shutdown.
//! - A local HTTP listener for the remote's callbacks. Validation
//!   handshakes (`GET`/`POST` with a `validationToken` query parameter)
//!   are echoed back as `text/plain`; notification POSTs are accepted
//!   only when their `clientState` matches ours, and forwarded to the
//!   delta engine as a wake-up trigger.
//!
//! ## Microsoft Graph API references
//!
//! - [Subscriptions](https://learn.microsoft.com/en-us/graph/api/resources/subscription)

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Method;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use onemount_core::ports::{RemoteError, Subscription};

use crate::client::{transport_error, GraphClient};

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    expiration_date_time: String,
}

/// Registers a change-notification subscription.
pub async fn create_subscription(
    client: &GraphClient,
    resource: &str,
    notify_url: &str,
    client_state: &str,
    expiration: DateTime<Utc>,
) -> Result<Subscription, RemoteError> {
    let body = serde_json::json!({
        "changeType": "updated",
        "notificationUrl": notify_url,
        "resource": resource,
        "expirationDateTime": expiration.to_rfc3339(),
        "clientState": client_state,
    });
    let builder = client.request(Method::POST, "/subscriptions").await?.json(&body);
    let response: SubscriptionResponse = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    let expiration = response
        .expiration_date_time
        .parse::<DateTime<Utc>>()
        .map_err(|e| RemoteError::Fatal(format!("unparseable subscription expiration: {}", e)))?;
    info!(id = %response.id, %expiration, "subscription created");
    Ok(Subscription {
        id: response.id,
        expiration,
    })
}

/// Removes a webhook subscription.
pub async fn delete_subscription(client: &GraphClient, id: &str) -> Result<(), RemoteError> {
    let builder = client
        .request(Method::DELETE, &format!("/subscriptions/{}", id))
        .await?;
    client.send(builder).await?;
    Ok(())
}

// ============================================================================
// Notification listener
// ============================================================================

/// One accepted notification, forwarded to the delta engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookNotification {
    pub subscription_id: String,
    pub resource: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationEnvelope {
    value: Vec<NotificationBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationBody {
    subscription_id: Option<String>,
    client_state: Option<String>,
    resource: Option<String>,
}

/// HTTP listener for validation handshakes and notifications.
pub struct WebhookListener {
    listener: TcpListener,
    client_state: Arc<str>,
    trigger: mpsc::Sender<WebhookNotification>,
}

impl WebhookListener {
    /// Binds the listen socket. Port 0 picks an ephemeral port,
    /// readable afterwards via [`local_addr`](Self::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        client_state: impl Into<Arc<str>>,
        trigger: mpsc::Sender<WebhookNotification>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "webhook listener bound");
        Ok(Self {
            listener,
            client_state: client_state.into(),
            trigger,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the task is aborted.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = self.listener;
        let client_state = self.client_state;
        let trigger = self.trigger;

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "webhook connection accepted");
            let io = TokioIo::new(stream);
            let client_state = Arc::clone(&client_state);
            let trigger = trigger.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    handle_request(req, Arc::clone(&client_state), trigger.clone())
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(error = %e, "webhook connection error");
                }
            });
        }
    }
}

/// Handles one webhook HTTP request.
///
/// Exposed to tests; the listener wires it into hyper.
pub(crate) async fn handle_request(
    req: Request<hyper::body::Incoming>,
    client_state: Arc<str>,
    trigger: mpsc::Sender<WebhookNotification>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    // Validation handshake: echo the token back as text/plain.
    if let Some(token) = validation_token(req.uri().query()) {
        debug!("webhook validation handshake");
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(token)))
            .expect("static response builds"));
    }

    if req.method() != hyper::Method::POST {
        return Ok(plain_response(StatusCode::METHOD_NOT_ALLOWED, ""));
    }

    let body = req.into_body().collect().await?.to_bytes();
    let envelope: NotificationEnvelope = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable webhook notification");
            return Ok(plain_response(StatusCode::BAD_REQUEST, "bad notification"));
        }
    };

    for notification in envelope.value {
        match notification.client_state.as_deref() {
            Some(state) if state == &*client_state => {
                let _ = trigger.try_send(WebhookNotification {
                    subscription_id: notification.subscription_id.unwrap_or_default(),
                    resource: notification.resource.unwrap_or_default(),
                });
            }
            _ => {
                warn!("webhook notification rejected: clientState mismatch");
            }
        }
    }

    // The remote expects 2xx quickly regardless; rejected notifications
    // were already logged and dropped.
    Ok(plain_response(StatusCode::ACCEPTED, ""))
}

fn plain_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response builds")
}

/// Extracts `validationToken` from a query string, percent-decoded.
fn validation_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("validationToken") {
            let raw = parts.next().unwrap_or("");
            return Some(percent_decode(raw));
        }
    }
    None
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_token_extraction() {
        assert_eq!(
            validation_token(Some("validationToken=abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(
            validation_token(Some("other=1&validationToken=a%20b%2Bc")),
            Some("a b+c".to_string())
        );
        assert_eq!(validation_token(Some("other=1")), None);
        assert_eq!(validation_token(None), None);
    }

    #[test]
    fn test_percent_decode_plus_is_space() {
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%25"), "100%");
    }

    #[test]
    fn test_notification_envelope_parsing() {
        let json = r#"{
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "secret",
                "resource": "/me/drive/root"
            }]
        }"#;
        let env: NotificationEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.value.len(), 1);
        assert_eq!(env.value[0].client_state.as_deref(), Some("secret"));
    }
}
