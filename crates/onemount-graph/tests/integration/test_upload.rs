//! Resumable upload session tests.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onemount_core::ports::{ChunkRange, ChunkStatus, RemoteError, RemoteStore, UploadTarget};

use crate::common::{drive_item_json, setup};

async fn mount_session_endpoint(server: &MockServer, upload_url: &str) {
    Mock::given(method("POST"))
        .and(path("/me/drive/items/ROOT:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": upload_url,
            "expirationDateTime": "2026-06-15T12:00:00Z"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn create_session_returns_url_and_expiration() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-1", server.uri());
    mount_session_endpoint(&server, &upload_url).await;

    let target = UploadTarget::ChildOf {
        parent_id: "ROOT".into(),
        name: "big.bin".into(),
    };
    let session = store.create_upload_session(&target).await.unwrap();
    assert_eq!(session.upload_url, upload_url);
    assert!(session.expiration.is_some());
}

#[tokio::test]
async fn intermediate_chunk_is_accepted() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-2", server.uri());

    Mock::given(method("PUT"))
        .and(path("/up/session-2"))
        .and(header("Content-Range", "bytes 0-10485759/12582912"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "expirationDateTime": "2026-06-15T12:00:00Z",
            "nextExpectedRanges": ["10485760-"]
        })))
        .mount(&server)
        .await;

    let range = ChunkRange {
        offset: 0,
        len: 10 * 1024 * 1024,
        total: 12 * 1024 * 1024,
    };
    let status = store
        .put_chunk(&upload_url, range, &vec![0u8; range.len as usize])
        .await
        .unwrap();
    assert!(matches!(status, ChunkStatus::Accepted));
}

#[tokio::test]
async fn final_chunk_completes_with_item() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-3", server.uri());

    Mock::given(method("PUT"))
        .and(path("/up/session-3"))
        .and(header("Content-Range", "bytes 10485760-12582911/12582912"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(drive_item_json("BIG1", "big.bin", 12582912, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")),
        )
        .mount(&server)
        .await;

    let range = ChunkRange {
        offset: 10 * 1024 * 1024,
        len: 2 * 1024 * 1024,
        total: 12 * 1024 * 1024,
    };
    let status = store
        .put_chunk(&upload_url, range, &vec![0u8; range.len as usize])
        .await
        .unwrap();
    match status {
        ChunkStatus::Complete(Some(item)) => {
            assert_eq!(item.id, "BIG1");
            assert_eq!(item.size, Some(12582912));
        }
        other => panic!("expected completion with item, got {:?}", other),
    }
}

#[tokio::test]
async fn final_chunk_with_empty_body_reports_no_item() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-4", server.uri());

    Mock::given(method("PUT"))
        .and(path("/up/session-4"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let range = ChunkRange {
        offset: 0,
        len: 4,
        total: 4,
    };
    let status = store.put_chunk(&upload_url, range, b"abcd").await.unwrap();
    assert!(matches!(status, ChunkStatus::Complete(None)));
}

#[tokio::test]
async fn chunk_server_error_is_transient() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-5", server.uri());

    Mock::given(method("PUT"))
        .and(path("/up/session-5"))
        .respond_with(ResponseTemplate::new(500).set_body_string("generalException"))
        .mount(&server)
        .await;

    let range = ChunkRange {
        offset: 0,
        len: 4,
        total: 4,
    };
    let err = store.put_chunk(&upload_url, range, b"abcd").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn chunk_bad_request_is_fatal() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-6", server.uri());

    Mock::given(method("PUT"))
        .and(path("/up/session-6"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalidRange"))
        .mount(&server)
        .await;

    let range = ChunkRange {
        offset: 0,
        len: 4,
        total: 4,
    };
    let err = store.put_chunk(&upload_url, range, b"abcd").await.unwrap_err();
    assert!(matches!(err, RemoteError::Fatal(_)));
}

#[tokio::test]
async fn cancel_session_tolerates_missing_url() {
    let (server, store) = setup().await;
    let upload_url = format!("{}/up/session-7", server.uri());

    Mock::given(method("DELETE"))
        .and(path("/up/session-7"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    store.cancel_upload_session(&upload_url).await.unwrap();
}
