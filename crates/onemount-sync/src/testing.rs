//! In-memory remote store double for manager tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use onemount_core::domain::{DeltaCursor, QuickXorHash};
use onemount_core::ports::{
    ChildPage, ChunkRange, ChunkStatus, ContentStream, DeltaPage, DriveQuota, RemoteError,
    RemoteItem, RemoteStore, Subscription, UploadSessionInfo, UploadTarget,
};

/// Scriptable in-memory remote.
///
/// Items and contents are plain maps; failure injection is a per-call
/// countdown of transient errors.
#[derive(Default)]
pub struct FakeRemote {
    pub items: DashMap<String, RemoteItem>,
    pub contents: DashMap<String, Vec<u8>>,
    /// Chunks received per upload URL.
    pub chunks: Mutex<HashMap<String, Vec<(ChunkRange, Vec<u8>)>>>,
    /// Queued delta batches, drained front first.
    pub delta_batches: Mutex<Vec<DeltaPage>>,
    next_id: AtomicU64,
    /// Remaining transient failures to inject for downloads.
    pub download_failures: AtomicU32,
    /// Remaining transient failures to inject for chunk PUTs.
    pub chunk_failures: AtomicU32,
    /// Remaining transient failures to inject for small PUTs.
    pub put_failures: AtomicU32,
    /// When true, every call fails as offline.
    pub unreachable: std::sync::atomic::AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn file(&self, id: &str, parent: &str, name: &str, content: &[u8]) -> RemoteItem {
        let item = RemoteItem {
            id: id.to_string(),
            name: name.to_string(),
            size: Some(content.len() as u64),
            etag: Some(format!("\"etag-{}-1\"", id)),
            quick_xor: Some(QuickXorHash::hash_base64(content)),
            mtime: Some(Utc::now()),
            is_directory: false,
            is_deleted: false,
            parent_id: Some(parent.to_string()),
        };
        self.items.insert(id.to_string(), item.clone());
        self.contents.insert(id.to_string(), content.to_vec());
        item
    }

    fn mint_id(&self) -> String {
        format!("R{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(RemoteError::Transient("network unreachable".into()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn target_ids(target: &UploadTarget) -> (Option<&str>, Option<(&str, &str)>) {
        match target {
            UploadTarget::Item(id) => (Some(id.as_str()), None),
            UploadTarget::ChildOf { parent_id, name } => {
                (None, Some((parent_id.as_str(), name.as_str())))
            }
        }
    }

    fn store_upload(&self, target: &UploadTarget, data: &[u8]) -> RemoteItem {
        let (by_id, by_child) = Self::target_ids(target);
        let (id, parent, name) = match (by_id, by_child) {
            (Some(id), _) => {
                let existing = self.items.get(id).expect("put to unknown item");
                (
                    id.to_string(),
                    existing.parent_id.clone().unwrap_or_default(),
                    existing.name.clone(),
                )
            }
            (None, Some((parent, name))) => (self.mint_id(), parent.to_string(), name.to_string()),
            _ => unreachable!(),
        };
        let old_rev = self
            .items
            .get(&id)
            .and_then(|i| i.etag.clone())
            .unwrap_or_default();
        let item = RemoteItem {
            id: id.clone(),
            name,
            size: Some(data.len() as u64),
            etag: Some(format!("\"etag-{}-{}\"", id, old_rev.len() + 2)),
            quick_xor: Some(QuickXorHash::hash_base64(data)),
            mtime: Some(Utc::now()),
            is_directory: false,
            is_deleted: false,
            parent_id: Some(parent),
        };
        self.items.insert(id.clone(), item.clone());
        self.contents.insert(id, data.to_vec());
        item
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn get_item(&self, id: &str) -> Result<RemoteItem, RemoteError> {
        self.check_reachable()?;
        self.items
            .get(id)
            .map(|i| i.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn get_child(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        self.check_reachable()?;
        self.items
            .iter()
            .find(|i| {
                i.parent_id.as_deref() == Some(parent_id)
                    && i.name.to_lowercase() == name.to_lowercase()
            })
            .map(|i| i.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", parent_id, name)))
    }

    async fn list_children(
        &self,
        parent_id: &str,
        _page: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        self.check_reachable()?;
        let items = self
            .items
            .iter()
            .filter(|i| i.parent_id.as_deref() == Some(parent_id))
            .map(|i| i.clone())
            .collect();
        Ok(ChildPage {
            items,
            next_page: None,
        })
    }

    async fn download_content(&self, id: &str) -> Result<ContentStream, RemoteError> {
        self.check_reachable()?;
        if Self::take_failure(&self.download_failures) {
            return Err(RemoteError::Transient("injected download failure".into()));
        }
        let content = self
            .contents
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let chunks: Vec<Result<Vec<u8>, RemoteError>> = content
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn put_small(
        &self,
        target: &UploadTarget,
        data: &[u8],
    ) -> Result<RemoteItem, RemoteError> {
        self.check_reachable()?;
        if Self::take_failure(&self.put_failures) {
            return Err(RemoteError::Transient("injected put failure".into()));
        }
        Ok(self.store_upload(target, data))
    }

    async fn create_upload_session(
        &self,
        target: &UploadTarget,
    ) -> Result<UploadSessionInfo, RemoteError> {
        self.check_reachable()?;
        let key = match target {
            UploadTarget::Item(id) => format!("item:{}", id),
            UploadTarget::ChildOf { parent_id, name } => format!("child:{}:{}", parent_id, name),
        };
        Ok(UploadSessionInfo {
            upload_url: format!("fake://upload/{}", key),
            expiration: Some(Utc::now() + chrono::Duration::minutes(15)),
        })
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        range: ChunkRange,
        data: &[u8],
    ) -> Result<ChunkStatus, RemoteError> {
        self.check_reachable()?;
        if Self::take_failure(&self.chunk_failures) {
            return Err(RemoteError::Transient("injected chunk failure".into()));
        }
        let mut chunks = self.chunks.lock().await;
        let received = chunks.entry(upload_url.to_string()).or_default();
        received.push((range, data.to_vec()));

        let total_received: u64 = received.iter().map(|(r, _)| r.len).sum();
        if total_received < range.total || range.offset + range.len < range.total {
            return Ok(ChunkStatus::Accepted);
        }

        // Assemble and store under the session's target.
        let mut assembled = vec![0u8; range.total as usize];
        for (r, bytes) in received.iter() {
            assembled[r.offset as usize..(r.offset + r.len) as usize].copy_from_slice(bytes);
        }
        let target = if let Some(id) = upload_url.strip_prefix("fake://upload/item:") {
            UploadTarget::Item(id.to_string())
        } else if let Some(rest) = upload_url.strip_prefix("fake://upload/child:") {
            let (parent, name) = rest.split_once(':').expect("well-formed fake url");
            UploadTarget::ChildOf {
                parent_id: parent.to_string(),
                name: name.to_string(),
            }
        } else {
            return Err(RemoteError::NotFound(upload_url.to_string()));
        };
        let item = self.store_upload(&target, &assembled);
        Ok(ChunkStatus::Complete(Some(item)))
    }

    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), RemoteError> {
        self.chunks.lock().await.remove(upload_url);
        Ok(())
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        self.check_reachable()?;
        let item = RemoteItem {
            id: self.mint_id(),
            name: name.to_string(),
            size: None,
            etag: Some("\"etag-folder-1\"".into()),
            quick_xor: None,
            mtime: Some(Utc::now()),
            is_directory: true,
            is_deleted: false,
            parent_id: Some(parent_id.to_string()),
        };
        self.items.insert(item.id.clone(), item.clone());
        Ok(item)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.check_reachable()?;
        if self.items.remove(id).is_none() {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        self.contents.remove(id);
        Ok(())
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent_id: &str,
    ) -> Result<RemoteItem, RemoteError> {
        self.check_reachable()?;
        let mut item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        item.name = new_name.to_string();
        item.parent_id = Some(new_parent_id.to_string());
        item.etag = Some(format!("\"etag-{}-renamed\"", id));
        Ok(item.clone())
    }

    async fn get_delta(&self, _cursor: Option<&DeltaCursor>) -> Result<DeltaPage, RemoteError> {
        self.check_reachable()?;
        let mut batches = self.delta_batches.lock().await;
        if batches.is_empty() {
            return Ok(DeltaPage {
                changes: Vec::new(),
                next_cursor: DeltaCursor::new("fake-cursor-empty"),
            });
        }
        Ok(batches.remove(0))
    }

    async fn create_subscription(
        &self,
        _resource: &str,
        _notify_url: &str,
        _client_state: &str,
        expiration: DateTime<Utc>,
    ) -> Result<Subscription, RemoteError> {
        Ok(Subscription {
            id: "fake-sub".into(),
            expiration,
        })
    }

    async fn delete_subscription(&self, _id: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn drive_quota(&self) -> Result<DriveQuota, RemoteError> {
        self.check_reachable()?;
        Ok(DriveQuota {
            total: 1 << 40,
            used: 1 << 30,
            file_count: None,
        })
    }
}
