//! [`RemoteStore`] implementation assembled from the endpoint modules.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use onemount_core::domain::DeltaCursor;
use onemount_core::ports::{
    ChildPage, ChunkRange, ChunkStatus, ContentStream, DeltaPage, DriveQuota, RemoteError, RemoteItem,
    RemoteStore, Subscription, TokenSource, UploadSessionInfo, UploadTarget,
};

use crate::client::GraphClient;
use crate::{delta, items, upload, webhook};

/// Production remote store over the Microsoft Graph API.
pub struct GraphStore {
    client: GraphClient,
}

impl GraphStore {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client: GraphClient::new(tokens),
        }
    }

    /// Points the store at a custom base URL (mock server in tests).
    pub fn with_base_url(tokens: Arc<dyn TokenSource>, base_url: impl Into<String>) -> Self {
        Self {
            client: GraphClient::with_base_url(tokens, base_url),
        }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }
}

#[async_trait]
impl RemoteStore for GraphStore {
    async fn get_item(&self, id: &str) -> Result<RemoteItem, RemoteError> {
        items::get_item(&self.client, id).await
    }

    async fn get_child(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        items::get_child(&self.client, parent_id, name).await
    }

    async fn list_children(
        &self,
        parent_id: &str,
        page: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        items::list_children(&self.client, parent_id, page).await
    }

    async fn download_content(&self, id: &str) -> Result<ContentStream, RemoteError> {
        items::download_content(&self.client, id).await
    }

    async fn put_small(
        &self,
        target: &UploadTarget,
        data: &[u8],
    ) -> Result<RemoteItem, RemoteError> {
        items::put_small(&self.client, target, data).await
    }

    async fn create_upload_session(
        &self,
        target: &UploadTarget,
    ) -> Result<UploadSessionInfo, RemoteError> {
        upload::create_upload_session(&self.client, target).await
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        range: ChunkRange,
        data: &[u8],
    ) -> Result<ChunkStatus, RemoteError> {
        upload::put_chunk(&self.client, upload_url, range, data).await
    }

    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), RemoteError> {
        upload::cancel_upload_session(&self.client, upload_url).await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        items::create_folder(&self.client, parent_id, name).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        items::delete(&self.client, id).await
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent_id: &str,
    ) -> Result<RemoteItem, RemoteError> {
        items::rename(&self.client, id, new_name, new_parent_id).await
    }

    async fn get_delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaPage, RemoteError> {
        delta::get_delta(&self.client, cursor).await
    }

    async fn create_subscription(
        &self,
        resource: &str,
        notify_url: &str,
        client_state: &str,
        expiration: DateTime<Utc>,
    ) -> Result<Subscription, RemoteError> {
        webhook::create_subscription(&self.client, resource, notify_url, client_state, expiration)
            .await
    }

    async fn delete_subscription(&self, id: &str) -> Result<(), RemoteError> {
        webhook::delete_subscription(&self.client, id).await
    }

    async fn drive_quota(&self) -> Result<DriveQuota, RemoteError> {
        items::drive_quota(&self.client).await
    }
}
