//! Delta feed tests.

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use onemount_core::domain::DeltaCursor;
use onemount_core::ports::RemoteStore;

use crate::common::{drive_item_json, setup};

#[tokio::test]
async fn initial_delta_returns_cursor() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                drive_item_json("F1", "a.txt", 12, "AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
                { "id": "GONE", "name": "old.txt", "deleted": {} },
            ],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=tok-1", server.uri()),
        })))
        .mount(&server)
        .await;

    let page = store.get_delta(None).await.unwrap();
    assert_eq!(page.changes.len(), 2);
    assert!(page.changes[1].is_deleted);
    assert!(page.next_cursor.as_str().contains("token=tok-1"));
}

#[tokio::test]
async fn delta_drains_all_pages_into_one_batch() {
    let (server, store) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [drive_item_json("P1", "page1.txt", 1, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")],
            "@odata.nextLink": format!("{}/me/drive/root/delta?page=2", server.uri()),
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [drive_item_json("P2", "page2.txt", 2, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=")],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=tok-2", server.uri()),
        })))
        .mount(&server)
        .await;

    let page = store.get_delta(None).await.unwrap();
    let ids: Vec<&str> = page.changes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["P1", "P2"]);
    assert!(page.next_cursor.as_str().contains("token=tok-2"));
}

#[tokio::test]
async fn persisted_cursor_resumes_the_feed() {
    let (server, store) = setup().await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "tok-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=tok-4", server.uri()),
        })))
        .mount(&server)
        .await;

    let cursor = DeltaCursor::new(format!("{}/me/drive/root/delta?token=tok-3", server.uri()));
    let page = store.get_delta(Some(&cursor)).await.unwrap();
    assert!(page.changes.is_empty());
    assert!(page.next_cursor.as_str().contains("token=tok-4"));
}
