//! Webhook subscription and listener tests.

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, ResponseTemplate};

use onemount_core::ports::RemoteStore;
use onemount_graph::WebhookListener;

use crate::common::setup;

#[tokio::test]
async fn subscription_lifecycle() {
    let (server, store) = setup().await;
    Mock::given(method("POST"))
        .and(path("/subscriptions"))
        .and(body_partial_json(serde_json::json!({
            "clientState": "secret-state",
            "resource": "/me/drive/root",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "sub-1",
            "expirationDateTime": "2026-06-16T00:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/subscriptions/sub-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let sub = store
        .create_subscription(
            "/me/drive/root",
            "https://example.test/webhook",
            "secret-state",
            Utc::now() + Duration::hours(24),
        )
        .await
        .unwrap();
    assert_eq!(sub.id, "sub-1");

    store.delete_subscription(&sub.id).await.unwrap();
}

#[tokio::test]
async fn listener_echoes_validation_token() {
    let (tx, _rx) = mpsc::channel(4);
    let listener = WebhookListener::bind("127.0.0.1:0".parse().unwrap(), "secret", tx)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let response = reqwest::get(format!(
        "http://{}/webhook?validationToken=hello%20token",
        addr
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["Content-Type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "hello token");
}

#[tokio::test]
async fn listener_forwards_matching_notifications() {
    let (tx, mut rx) = mpsc::channel(4);
    let listener = WebhookListener::bind("127.0.0.1:0".parse().unwrap(), "secret", tx)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/webhook", addr))
        .json(&serde_json::json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "secret",
                "resource": "/me/drive/root"
            }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.subscription_id, "sub-1");
    assert_eq!(notification.resource, "/me/drive/root");
}

#[tokio::test]
async fn listener_drops_mismatched_client_state() {
    let (tx, mut rx) = mpsc::channel(4);
    let listener = WebhookListener::bind("127.0.0.1:0".parse().unwrap(), "secret", tx)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/webhook", addr))
        .json(&serde_json::json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "wrong",
                "resource": "/me/drive/root"
            }]
        }))
        .send()
        .await
        .unwrap();
    // Accepted on the wire, dropped internally.
    assert_eq!(response.status(), 202);
    assert!(rx.try_recv().is_err());
}
