//! Resumable upload sessions: creation, ranged chunk PUTs, release.
//!
//! ## Microsoft Graph API references
//!
//! - [Upload large files](https://learn.microsoft.com/en-us/graph/api/driveitem-createuploadsession)

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use onemount_core::ports::{
    ChunkRange, ChunkStatus, RemoteError, UploadSessionInfo, UploadTarget,
};

use crate::client::{classify_status, transport_error, GraphClient};
use crate::items::{target_path, to_remote_item, GraphDriveItem};

/// Response from creating an upload session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    expiration_date_time: Option<String>,
}

/// Creates a resumable upload session for a target.
///
/// The returned URL accepts ranged PUTs and expires after a period of
/// inactivity; the caller persists it so a restart can resume.
pub async fn create_upload_session(
    client: &GraphClient,
    target: &UploadTarget,
) -> Result<UploadSessionInfo, RemoteError> {
    let path = target_path(target, "createUploadSession");
    debug!(%path, "creating upload session");

    let body = serde_json::json!({
        "item": { "@microsoft.graph.conflictBehavior": "replace" }
    });
    let builder = client.request(Method::POST, &path).await?.json(&body);
    let response: UploadSessionResponse = client
        .send(builder)
        .await?
        .json()
        .await
        .map_err(transport_error)?;

    let expiration = response
        .expiration_date_time
        .as_deref()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());

    Ok(UploadSessionInfo {
        upload_url: response.upload_url,
        expiration,
    })
}

/// Sends one chunk to a session URL with its `Content-Range`.
///
/// Session URLs are pre-authenticated and absolute, so this goes
/// through the raw HTTP client rather than the API base.
pub async fn put_chunk(
    client: &GraphClient,
    upload_url: &str,
    range: ChunkRange,
    data: &[u8],
) -> Result<ChunkStatus, RemoteError> {
    debug_assert_eq!(range.len, data.len() as u64);
    let content_range = range.header_value();
    debug!(%content_range, "uploading chunk");

    let response = client
        .http()
        .put(upload_url)
        .header("Content-Length", data.len().to_string())
        .header("Content-Range", &content_range)
        .body(data.to_vec())
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    match status {
        StatusCode::ACCEPTED => Ok(ChunkStatus::Accepted),
        StatusCode::OK | StatusCode::CREATED => {
            // The final chunk's body carries the completed item; some
            // deployments return an empty body instead, in which case
            // the uploader fetches the item to verify.
            let body = response.text().await.map_err(transport_error)?;
            if body.trim().is_empty() {
                return Ok(ChunkStatus::Complete(None));
            }
            let item: GraphDriveItem = serde_json::from_str(&body).map_err(|e| {
                RemoteError::Fatal(format!("unparseable final upload response: {}", e))
            })?;
            Ok(ChunkStatus::Complete(Some(to_remote_item(item))))
        }
        _ => Err(classify_status(status, response).await),
    }
}

/// Best-effort release of an abandoned session URL.
pub async fn cancel_upload_session(
    client: &GraphClient,
    upload_url: &str,
) -> Result<(), RemoteError> {
    let response = client
        .http()
        .delete(upload_url)
        .send()
        .await
        .map_err(transport_error)?;
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    Err(classify_status(status, response).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_session_response_deserialization() {
        let json = r#"{
            "uploadUrl": "https://sn3302.up.1drv.com/up/fe6987415ace7X4811700",
            "expirationDateTime": "2026-06-15T12:00:00Z"
        }"#;
        let response: UploadSessionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            response.upload_url,
            "https://sn3302.up.1drv.com/up/fe6987415ace7X4811700"
        );
        assert!(response.expiration_date_time.is_some());
    }
}
