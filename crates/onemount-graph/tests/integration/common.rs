//! Shared wiremock helpers for Graph adapter tests.

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onemount_core::ports::StaticTokenSource;
use onemount_graph::GraphStore;

/// Starts a mock server and a store pointed at it.
pub async fn setup() -> (MockServer, GraphStore) {
    let server = MockServer::start().await;
    let store = GraphStore::with_base_url(
        Arc::new(StaticTokenSource::new("test-access-token")),
        server.uri(),
    );
    (server, store)
}

/// JSON body of a file DriveItem.
pub fn drive_item_json(id: &str, name: &str, size: u64, quick_xor: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "size": size,
        "eTag": format!("\"etag-{}\"", id),
        "lastModifiedDateTime": "2026-06-15T10:30:00Z",
        "parentReference": { "id": "ROOT" },
        "file": { "hashes": { "quickXorHash": quick_xor } }
    })
}

/// Mounts a download endpoint for an item id.
pub async fn mount_download(server: &MockServer, item_id: &str, content: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/me/drive/items/{}/content", item_id)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.to_vec())
                .append_header("Content-Type", "application/octet-stream"),
        )
        .mount(server)
        .await;
}
