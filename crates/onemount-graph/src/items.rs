//! Item operations: metadata, listing, download, small upload,
//! delete and rename.
//!
//! ## Microsoft Graph API references
//!
//! - [Get item](https://learn.microsoft.com/en-us/graph/api/driveitem-get)
//! - [List children](https://learn.microsoft.com/en-us/graph/api/driveitem-list-children)
//! - [Download content](https://learn.microsoft.com/en-us/graph/api/driveitem-get-content)
//! - [Upload small files](https://learn.microsoft.com/en-us/graph/api/driveitem-put-content)

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use onemount_core::ports::{
    ChildPage, ContentStream, DriveQuota, RemoteError, RemoteItem, UploadTarget,
};

use crate::client::{transport_error, GraphClient};

// ============================================================================
// Graph API DriveItem response types
// ============================================================================

/// A DriveItem as the Graph API reports it.
///
/// Fields are `Option` because not all of them appear in every
/// response (deleted items lack file metadata, folders lack hashes).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphDriveItem {
    pub id: String,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub e_tag: Option<String>,
    pub last_modified_date_time: Option<String>,
    pub parent_reference: Option<ParentReference>,
    pub file: Option<FileInfo>,
    pub folder: Option<serde_json::Value>,
    pub deleted: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ParentReference {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileInfo {
    pub hashes: Option<FileHashes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileHashes {
    pub quick_xor_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenResponse {
    value: Vec<GraphDriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveResponse {
    quota: Option<QuotaResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaResponse {
    total: Option<u64>,
    used: Option<u64>,
    file_count: Option<u64>,
}

// ============================================================================
// DTO conversion
// ============================================================================

/// Maps a Graph DriveItem into the port-level [`RemoteItem`] DTO.
pub(crate) fn to_remote_item(item: GraphDriveItem) -> RemoteItem {
    let is_directory = item.folder.is_some();
    let is_deleted = item.deleted.is_some();

    let mtime = item
        .last_modified_date_time
        .as_deref()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());

    let quick_xor = item
        .file
        .as_ref()
        .and_then(|f| f.hashes.as_ref())
        .and_then(|h| h.quick_xor_hash.clone());

    RemoteItem {
        id: item.id,
        name: item.name.unwrap_or_default(),
        size: item.size,
        etag: item.e_tag,
        quick_xor,
        mtime,
        is_directory,
        is_deleted,
        parent_id: item.parent_reference.and_then(|p| p.id),
    }
}

/// API path addressing an upload target.
///
/// - Existing item: `/me/drive/items/{id}/{suffix}`
/// - Child by name: `/me/drive/items/{parent-id}:/{name}:/{suffix}`
pub(crate) fn target_path(target: &UploadTarget, suffix: &str) -> String {
    match target {
        UploadTarget::Item(id) => format!("/me/drive/items/{}/{}", id, suffix),
        UploadTarget::ChildOf { parent_id, name } => {
            format!("/me/drive/items/{}:/{}:/{}", parent_id, name, suffix)
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Fetches metadata for one item.
pub async fn get_item(client: &GraphClient, id: &str) -> Result<RemoteItem, RemoteError> {
    let builder = client
        .request(Method::GET, &format!("/me/drive/items/{}", id))
        .await?;
    let item: GraphDriveItem = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(to_remote_item(item))
}

/// Looks up a child by name under a parent folder.
pub async fn get_child(
    client: &GraphClient,
    parent_id: &str,
    name: &str,
) -> Result<RemoteItem, RemoteError> {
    let builder = client
        .request(
            Method::GET,
            &format!("/me/drive/items/{}:/{}:", parent_id, name),
        )
        .await?;
    let item: GraphDriveItem = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(to_remote_item(item))
}

/// Lists one page of a folder's children.
///
/// `page` is the opaque `@odata.nextLink` from a previous page; `None`
/// starts at the first page.
pub async fn list_children(
    client: &GraphClient,
    parent_id: &str,
    page: Option<&str>,
) -> Result<ChildPage, RemoteError> {
    let builder = match page {
        Some(link) => client.request_url(Method::GET, link).await?,
        None => {
            client
                .request(Method::GET, &format!("/me/drive/items/{}/children", parent_id))
                .await?
        }
    };
    let response: ChildrenResponse = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(ChildPage {
        items: response.value.into_iter().map(to_remote_item).collect(),
        next_page: response.next_link,
    })
}

/// Streams an item's content.
pub async fn download_content(
    client: &GraphClient,
    id: &str,
) -> Result<ContentStream, RemoteError> {
    let builder = client
        .request(Method::GET, &format!("/me/drive/items/{}/content", id))
        .await?;
    let response = client.send(builder).await?;
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()).map_err(transport_error));
    Ok(Box::pin(stream))
}

/// Single-PUT upload for content under the large-file boundary.
pub async fn put_small(
    client: &GraphClient,
    target: &UploadTarget,
    data: &[u8],
) -> Result<RemoteItem, RemoteError> {
    let path = target_path(target, "content");
    debug!(bytes = data.len(), %path, "uploading small file");
    let builder = client
        .request(Method::PUT, &path)
        .await?
        .header("Content-Type", "application/octet-stream")
        .body(data.to_vec());
    let item: GraphDriveItem = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(to_remote_item(item))
}

/// Creates a folder under a parent.
pub async fn create_folder(
    client: &GraphClient,
    parent_id: &str,
    name: &str,
) -> Result<RemoteItem, RemoteError> {
    let body = serde_json::json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": "fail",
    });
    let builder = client
        .request(Method::POST, &format!("/me/drive/items/{}/children", parent_id))
        .await?
        .json(&body);
    let item: GraphDriveItem = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(to_remote_item(item))
}

/// Deletes an item.
pub async fn delete(client: &GraphClient, id: &str) -> Result<(), RemoteError> {
    let builder = client
        .request(Method::DELETE, &format!("/me/drive/items/{}", id))
        .await?;
    client.send(builder).await?;
    Ok(())
}

/// Renames and/or moves an item.
pub async fn rename(
    client: &GraphClient,
    id: &str,
    new_name: &str,
    new_parent_id: &str,
) -> Result<RemoteItem, RemoteError> {
    let body = serde_json::json!({
        "name": new_name,
        "parentReference": { "id": new_parent_id },
    });
    let builder = client
        .request(Method::PATCH, &format!("/me/drive/items/{}", id))
        .await?
        .json(&body);
    let item: GraphDriveItem = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(to_remote_item(item))
}

/// Current drive quota.
pub async fn drive_quota(client: &GraphClient) -> Result<DriveQuota, RemoteError> {
    let builder = client.request(Method::GET, "/me/drive").await?;
    let response: DriveResponse = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    let quota = response.quota.unwrap_or(QuotaResponse {
        total: None,
        used: None,
        file_count: None,
    });
    Ok(DriveQuota {
        total: quota.total.unwrap_or(0),
        used: quota.used.unwrap_or(0),
        file_count: quota.file_count,
    })
}
