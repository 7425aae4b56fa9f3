//! Delta feed: incremental change enumeration.
//!
//! The cursor handed back to callers is the full `@odata.deltaLink`
//! URL, treated as opaque: persisting and replaying it resumes the
//! feed exactly where the last applied batch left off. Pages linked by
//! `@odata.nextLink` are drained into a single batch so the caller
//! can apply them atomically before the cursor advances.
//!
//! ## Microsoft Graph API references
//!
//! - [Track changes](https://learn.microsoft.com/en-us/graph/api/driveitem-delta)

use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use onemount_core::domain::DeltaCursor;
use onemount_core::ports::{DeltaPage, RemoteError};

use crate::client::{transport_error, GraphClient};
use crate::items::{to_remote_item, GraphDriveItem};

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    value: Vec<GraphDriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Fetches the next change batch.
///
/// `None` starts a full enumeration from the drive root. All pages of
/// the batch are drained before returning, so the resulting
/// [`DeltaPage`] is atomic from the caller's point of view.
pub async fn get_delta(
    client: &GraphClient,
    cursor: Option<&DeltaCursor>,
) -> Result<DeltaPage, RemoteError> {
    let mut changes = Vec::new();
    let mut next: Option<String> = None;

    loop {
        let builder = match (&next, cursor) {
            // Mid-batch pagination.
            (Some(link), _) => client.request_url(Method::GET, link).await?,
            // Resume from a persisted cursor (an absolute deltaLink).
            (None, Some(cursor)) => client.request_url(Method::GET, cursor.as_str()).await?,
            // Initial full enumeration.
            (None, None) => client.request(Method::GET, "/me/drive/root/delta").await?,
        };

        let response: DeltaResponse = client
            .send(builder)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        changes.extend(response.value.into_iter().map(to_remote_item));

        match (response.next_link, response.delta_link) {
            (Some(link), _) => next = Some(link),
            (None, Some(delta_link)) => {
                debug!(changes = changes.len(), "delta batch complete");
                return Ok(DeltaPage {
                    changes,
                    next_cursor: DeltaCursor::new(delta_link),
                });
            }
            (None, None) => {
                return Err(RemoteError::Fatal(
                    "delta response carried neither nextLink nor deltaLink".to_string(),
                ));
            }
        }
    }
}
