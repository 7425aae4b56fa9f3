//! Remote store port (driven/secondary port).
//!
//! Everything the engine requires from the cloud backend, expressed as
//! a provider-agnostic trait plus port-level DTOs. The production
//! implementation targets the Microsoft Graph API; tests use an
//! in-memory double. Use cases map [`RemoteItem`] DTOs to domain
//! entries; the DTO never leaks kernel-facing concerns.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::DeltaCursor;
use crate::error::CoreError;

// ============================================================================
// Errors
// ============================================================================

/// Classified failures from the remote adapter.
///
/// The transfer managers only need the transient/fatal split; the
/// remaining variants carry the §7-style kind through to the errno
/// mapping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote item not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("insufficient remote storage: {0}")]
    OutOfSpace(String),

    /// 429 with an optional Retry-After hint.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Network failure or 5xx; safe to retry.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// 409 or an ETag precondition failure.
    #[error("remote conflict: {0}")]
    Conflict(String),

    /// 4xx other than 401/403/404/409/429; retrying will not help.
    #[error("remote request failed permanently: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_) | RemoteError::RateLimited { .. }
        )
    }
}

impl From<RemoteError> for CoreError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(m) => CoreError::NotFound(m),
            RemoteError::PermissionDenied(m) => CoreError::PermissionDenied(m),
            RemoteError::OutOfSpace(m) => CoreError::OutOfSpace(m),
            RemoteError::RateLimited { .. } => CoreError::Transient(e.to_string()),
            RemoteError::Transient(m) => CoreError::Transient(m),
            RemoteError::Conflict(m) => CoreError::Conflict(m),
            RemoteError::Fatal(m) => CoreError::Io(m),
        }
    }
}

// ============================================================================
// DTOs
// ============================================================================

/// A remote item as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Backend-assigned opaque identifier.
    pub id: String,
    pub name: String,
    /// None for folders and deleted items.
    pub size: Option<u64>,
    /// Opaque change validator.
    pub etag: Option<String>,
    /// QuickXOR wire form; None for folders.
    pub quick_xor: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
    pub is_directory: bool,
    /// Present in delta feeds for removed items.
    pub is_deleted: bool,
    pub parent_id: Option<String>,
}

/// One page of a directory listing.
#[derive(Debug, Clone)]
pub struct ChildPage {
    pub items: Vec<RemoteItem>,
    /// Opaque token for the next page; None on the last page.
    pub next_page: Option<String>,
}

/// One batch from the change feed.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub changes: Vec<RemoteItem>,
    /// Cursor to persist once the batch has been applied.
    pub next_cursor: DeltaCursor,
}

/// Where an upload lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Replace the content of an existing item.
    Item(String),
    /// Create or replace `name` under a parent folder.
    ChildOf { parent_id: String, name: String },
}

/// A created resumable upload session.
#[derive(Debug, Clone)]
pub struct UploadSessionInfo {
    pub upload_url: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// Byte range of one chunk within a resumable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: u64,
    pub total: u64,
}

impl ChunkRange {
    /// `Content-Range` header value: `bytes start-end/total`.
    pub fn header_value(&self) -> String {
        format!(
            "bytes {}-{}/{}",
            self.offset,
            self.offset + self.len - 1,
            self.total
        )
    }
}

/// Outcome of one chunk PUT.
#[derive(Debug, Clone)]
pub enum ChunkStatus {
    /// 202: intermediate chunk accepted.
    Accepted,
    /// 200/201: session complete; the final item, when the body had one.
    Complete(Option<RemoteItem>),
}

/// A change-notification subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub expiration: DateTime<Utc>,
}

/// Remote drive quota, for statfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveQuota {
    pub total: u64,
    pub used: u64,
    /// None when the backend does not expose one; statfs synthesizes
    /// a figure from the local cache in that case.
    pub file_count: Option<u64>,
}

/// Streamed file content.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RemoteError>> + Send>>;

// ============================================================================
// RemoteStore trait
// ============================================================================

/// Port trait for the cloud backend.
///
/// Implementations classify HTTP failures into [`RemoteError`] kinds
/// and perform no retries of their own: retry policy belongs to the
/// transfer managers so it is applied uniformly.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches metadata for one item.
    async fn get_item(&self, id: &str) -> Result<RemoteItem, RemoteError>;

    /// Looks up a child by name under a parent folder.
    async fn get_child(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError>;

    /// Lists one page of a folder's children.
    async fn list_children(
        &self,
        parent_id: &str,
        page: Option<&str>,
    ) -> Result<ChildPage, RemoteError>;

    /// Streams an item's content.
    async fn download_content(&self, id: &str) -> Result<ContentStream, RemoteError>;

    /// Single-request upload for content under the large-file boundary.
    async fn put_small(
        &self,
        target: &UploadTarget,
        data: &[u8],
    ) -> Result<RemoteItem, RemoteError>;

    /// Creates a resumable upload session.
    async fn create_upload_session(
        &self,
        target: &UploadTarget,
    ) -> Result<UploadSessionInfo, RemoteError>;

    /// Sends one ranged chunk to a session URL.
    async fn put_chunk(
        &self,
        upload_url: &str,
        range: ChunkRange,
        data: &[u8],
    ) -> Result<ChunkStatus, RemoteError>;

    /// Best-effort release of an abandoned session URL.
    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), RemoteError>;

    /// Creates a folder under a parent.
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError>;

    /// Deletes an item.
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    /// Renames and/or moves an item.
    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent_id: &str,
    ) -> Result<RemoteItem, RemoteError>;

    /// Fetches the next change batch. `None` starts a full enumeration.
    async fn get_delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaPage, RemoteError>;

    /// Registers a change-notification webhook.
    async fn create_subscription(
        &self,
        resource: &str,
        notify_url: &str,
        client_state: &str,
        expiration: DateTime<Utc>,
    ) -> Result<Subscription, RemoteError>;

    /// Removes a webhook subscription.
    async fn delete_subscription(&self, id: &str) -> Result<(), RemoteError>;

    /// Current drive quota.
    async fn drive_quota(&self) -> Result<DriveQuota, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_range_header() {
        let r = ChunkRange {
            offset: 0,
            len: 10 * 1024 * 1024,
            total: 12 * 1024 * 1024,
        };
        assert_eq!(r.header_value(), "bytes 0-10485759/12582912");

        let r = ChunkRange {
            offset: 10 * 1024 * 1024,
            len: 2 * 1024 * 1024,
            total: 12 * 1024 * 1024,
        };
        assert_eq!(r.header_value(), "bytes 10485760-12582911/12582912");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Transient("timeout".into()).is_transient());
        assert!(RemoteError::RateLimited {
            retry_after_secs: Some(3)
        }
        .is_transient());
        assert!(!RemoteError::NotFound("x".into()).is_transient());
        assert!(!RemoteError::Fatal("400".into()).is_transient());
    }

    #[test]
    fn test_core_error_mapping() {
        let e: CoreError = RemoteError::OutOfSpace("quota".into()).into();
        assert!(matches!(e, CoreError::OutOfSpace(_)));
        let e: CoreError = RemoteError::RateLimited {
            retry_after_secs: None,
        }
        .into();
        assert!(e.is_transient());
    }
}
