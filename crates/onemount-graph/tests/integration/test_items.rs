//! Item endpoint tests: metadata, children, download, delete, rename.

use futures_util::StreamExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onemount_core::ports::{RemoteError, RemoteStore, UploadTarget};

use crate::common::{drive_item_json, mount_download, setup};

#[tokio::test]
async fn get_item_maps_fields() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(drive_item_json("F1", "a.txt", 12, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")),
        )
        .mount(&server)
        .await;

    let item = store.get_item("F1").await.unwrap();
    assert_eq!(item.id, "F1");
    assert_eq!(item.name, "a.txt");
    assert_eq!(item.size, Some(12));
    assert_eq!(item.etag.as_deref(), Some("\"etag-F1\""));
    assert_eq!(item.quick_xor.as_deref(), Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA="));
    assert_eq!(item.parent_id.as_deref(), Some("ROOT"));
}

#[tokio::test]
async fn get_item_not_found_is_classified() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/MISSING"))
        .respond_with(ResponseTemplate::new(404).set_body_string("itemNotFound"))
        .mount(&server)
        .await;

    let err = store.get_item("MISSING").await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("serviceNotAvailable"))
        .mount(&server)
        .await;

    let err = store.get_item("F1").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(
            ResponseTemplate::new(429)
                .append_header("Retry-After", "7")
                .set_body_string("activityLimitReached"),
        )
        .mount(&server)
        .await;

    let err = store.get_item("F1").await.unwrap_err();
    assert_eq!(
        err,
        RemoteError::RateLimited {
            retry_after_secs: Some(7)
        }
    );
}

#[tokio::test]
async fn get_child_addresses_by_parent_and_name() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/DIR1:/report.docx:"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(drive_item_json("F2", "report.docx", 99, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")),
        )
        .mount(&server)
        .await;

    let item = store.get_child("DIR1", "report.docx").await.unwrap();
    assert_eq!(item.id, "F2");
}

#[tokio::test]
async fn list_children_follows_pages() {
    let (server, store) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/DIR1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [drive_item_json("C1", "one.txt", 1, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")],
            "@odata.nextLink": format!("{}/me/drive/items/DIR1/children?page=2", server.uri()),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/DIR1/children"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [drive_item_json("C2", "two.txt", 2, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")],
        })))
        .mount(&server)
        .await;

    let first = store.list_children("DIR1", None).await.unwrap();
    assert_eq!(first.items.len(), 1);
    let link = first.next_page.expect("first page links to the second");

    let second = store.list_children("DIR1", Some(&link)).await.unwrap();
    assert_eq!(second.items[0].id, "C2");
    assert!(second.next_page.is_none());
}

#[tokio::test]
async fn download_streams_content() {
    let (server, store) = setup().await;
    let payload = b"streamed file content".to_vec();
    mount_download(&server, "F1", &payload).await;

    let mut stream = store.download_content("F1").await.unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend(chunk.unwrap());
    }
    assert_eq!(collected, payload);
}

#[tokio::test]
async fn put_small_by_parent_and_name() {
    let (server, store) = setup().await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/items/ROOT:/new.txt:/content"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(drive_item_json("N1", "new.txt", 5, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")),
        )
        .mount(&server)
        .await;

    let target = UploadTarget::ChildOf {
        parent_id: "ROOT".into(),
        name: "new.txt".into(),
    };
    let item = store.put_small(&target, b"hello").await.unwrap();
    assert_eq!(item.id, "N1");
}

#[tokio::test]
async fn put_small_out_of_space() {
    let (server, store) = setup().await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/items/F1/content"))
        .respond_with(ResponseTemplate::new(507).set_body_string("insufficientStorage"))
        .mount(&server)
        .await;

    let err = store
        .put_small(&UploadTarget::Item("F1".into()), b"x")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::OutOfSpace(_)));
}

#[tokio::test]
async fn delete_and_rename() {
    let (server, store) = setup().await;
    Mock::given(method("DELETE"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/me/drive/items/F2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(drive_item_json("F2", "renamed.txt", 3, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")),
        )
        .mount(&server)
        .await;

    store.delete("F1").await.unwrap();
    let item = store.rename("F2", "renamed.txt", "NEWPARENT").await.unwrap();
    assert_eq!(item.name, "renamed.txt");
}

#[tokio::test]
async fn quota_is_reported() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "drive-1",
            "quota": { "total": 5368709120_u64, "used": 1073741824_u64 }
        })))
        .mount(&server)
        .await;

    let quota = store.drive_quota().await.unwrap();
    assert_eq!(quota.total, 5368709120);
    assert_eq!(quota.used, 1073741824);
    assert!(quota.file_count.is_none());
}
