//! Upload manager: pushing local mutations to the remote.
//!
//! Queueing snapshots the entry and its content into an immutable
//! [`UploadSession`]; later writes create further sessions, and the
//! per-item serialization lock guarantees sessions for one item are
//! delivered in queue order. Workers consume sessions from bounded
//! priority channels (producers block on a full queue, never spin).
//!
//! Strategy is dispatched on size at the 4 MiB boundary: a single PUT
//! below it, a resumable session of 10 MiB ranged chunks at or above
//! it. Chunk progress is checkpointed to the metadata store after
//! every acknowledged chunk, so a crashed process resumes at
//! `(last_successful_chunk + 1) * chunk_size` instead of byte zero.
//!
//! Every reported success is verified: the remote's QuickXOR must
//! equal the snapshot's (or, when the remote reports no hash, the
//! sizes must agree). The first successful upload of a locally created
//! item exchanges its provisional id for the remote one everywhere.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::{ContentStore, MetadataStore};
use onemount_core::domain::upload_session::UPLOAD_CHUNK_SIZE;
use onemount_core::domain::{
    Entry, ItemId, ItemState, TransferKind, TransferPriority, TransitionOptions, UploadSession,
};
use onemount_core::domain::item::ErrorDetails;
use onemount_core::ports::{
    ChunkRange, ChunkStatus, EventSink, RemoteItem, RemoteStore, UploadTarget,
};
use onemount_core::{CoreError, FileStatus};

use crate::backoff::BackoffPolicy;
use crate::state::StateManager;

// ============================================================================
// Bounded priority channels
// ============================================================================

struct SessionQueue {
    tx: [mpsc::Sender<UploadSession>; 3],
    rx: Mutex<[mpsc::Receiver<UploadSession>; 3]>,
}

impl SessionQueue {
    fn new(depth: usize) -> Self {
        let (high_tx, high_rx) = mpsc::channel(depth);
        let (normal_tx, normal_rx) = mpsc::channel(depth);
        let (low_tx, low_rx) = mpsc::channel(depth);
        Self {
            tx: [high_tx, normal_tx, low_tx],
            rx: Mutex::new([high_rx, normal_rx, low_rx]),
        }
    }

    fn slot(priority: TransferPriority) -> usize {
        match priority {
            TransferPriority::High => 0,
            TransferPriority::Normal => 1,
            TransferPriority::Low => 2,
        }
    }

    /// Blocking send with backpressure from the bounded channel.
    async fn push(&self, session: UploadSession) -> Result<(), CoreError> {
        let slot = Self::slot(session.priority);
        self.tx[slot]
            .send(session)
            .await
            .map_err(|_| CoreError::Cancelled)
    }

    /// Receives the next session, high priority first.
    async fn pop(&self, cancel: &CancellationToken) -> Option<UploadSession> {
        let mut rx = self.rx.lock().await;
        let [high, normal, low] = &mut *rx;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            Some(s) = high.recv() => Some(s),
            Some(s) = normal.recv() => Some(s),
            Some(s) = low.recv() => Some(s),
            else => None,
        }
    }
}

// ============================================================================
// UploadManager
// ============================================================================

type ExchangeHook = Box<dyn Fn(&ItemId, &ItemId) + Send + Sync>;

/// Uploads dirty items, durably resumable across restarts.
pub struct UploadManager {
    state: Arc<StateManager>,
    content: Arc<ContentStore>,
    remote: Arc<dyn RemoteStore>,
    events: Arc<dyn EventSink>,
    queue: SessionQueue,
    /// Outstanding (queued or running) sessions per item.
    pending: DashMap<ItemId, usize>,
    /// Serializes session processing per item.
    serial: DashMap<ItemId, Arc<Mutex<()>>>,
    active: DashMap<ItemId, CancellationToken>,
    /// Signalled whenever a session finishes, for waiters.
    settled: Notify,
    low_permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
    exchange_hooks: std::sync::RwLock<Vec<ExchangeHook>>,
}

impl UploadManager {
    pub fn new(
        state: Arc<StateManager>,
        content: Arc<ContentStore>,
        remote: Arc<dyn RemoteStore>,
        events: Arc<dyn EventSink>,
        queue_depth: usize,
        low_parallelism: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            content,
            remote,
            events,
            queue: SessionQueue::new(queue_depth),
            pending: DashMap::new(),
            serial: DashMap::new(),
            active: DashMap::new(),
            settled: Notify::new(),
            low_permits: Arc::new(Semaphore::new(low_parallelism.max(1))),
            backoff: BackoffPolicy::default(),
            shutdown: CancellationToken::new(),
            exchange_hooks: std::sync::RwLock::new(Vec::new()),
        })
    }

    /// Registers a callback run after a provisional→remote id exchange.
    /// The inode table uses this to stay in step with the stores.
    pub fn on_id_exchanged<F>(&self, hook: F)
    where
        F: Fn(&ItemId, &ItemId) + Send + Sync + 'static,
    {
        self.exchange_hooks.write().expect("hook lock").push(Box::new(hook));
    }

    pub fn spawn_workers(self: &Arc<Self>, n: usize) {
        for worker in 0..n {
            let mgr = Arc::clone(self);
            let label = format!("ul-{}", worker);
            tokio::spawn(async move {
                mgr.worker_loop(label).await;
            });
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    fn metadata(&self) -> &MetadataStore {
        self.state.metadata()
    }

    /// Snapshots the entry's current content and queues an upload.
    ///
    /// The returned session is immutable; a write after this call must
    /// queue again to be delivered.
    pub async fn queue(
        &self,
        id: &ItemId,
        priority: TransferPriority,
    ) -> Result<UploadSession, CoreError> {
        let entry = self.metadata().get(id).await.map_err(CoreError::from)?;
        if entry.is_virtual() || entry.is_directory() {
            return Err(CoreError::InvalidName(entry.name().to_string()));
        }

        let data = match self.content.read_all(id) {
            Ok(data) => data,
            // A created-then-never-written file has no blob yet.
            Err(onemount_cache::CacheError::BlobIo(ref e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let session = UploadSession::snapshot(&entry, data, priority);
        self.metadata()
            .save_upload(&session)
            .await
            .map_err(CoreError::from)?;
        self.enqueue(session.clone()).await?;
        debug!(%id, size = session.size, ?priority, "upload queued");
        Ok(session)
    }

    async fn enqueue(&self, session: UploadSession) -> Result<(), CoreError> {
        *self.pending.entry(session.id.clone()).or_insert(0) += 1;
        let id = session.id.clone();
        if let Err(e) = self.queue.push(session).await {
            self.decrement_pending(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Creates a locally minted directory on the remote and exchanges
    /// its provisional id.
    ///
    /// Directories carry no content, so they bypass the session
    /// pipeline; the id exchange is the same as for files.
    pub async fn sync_folder(&self, id: &ItemId) -> Result<ItemId, CoreError> {
        let entry = self.metadata().get(id).await.map_err(CoreError::from)?;
        if !entry.is_directory() {
            return Err(CoreError::InvalidName(entry.name().to_string()));
        }
        if let Some(remote_id) = id.as_remote() {
            // Already remote; nothing to create.
            return Ok(ItemId::remote(remote_id));
        }
        let parent = entry
            .parent_id()
            .as_remote()
            .ok_or_else(|| {
                CoreError::Transient("parent not yet created remotely".to_string())
            })?
            .to_string();
        let created = self
            .remote
            .create_folder(&parent, entry.name())
            .await
            .map_err(CoreError::from)?;
        let new_id = ItemId::remote(created.id);
        self.metadata()
            .exchange_id(id, &new_id)
            .await
            .map_err(CoreError::from)?;
        for hook in self.exchange_hooks.read().expect("hook lock").iter() {
            hook(id, &new_id);
        }
        self.state.forget(id);
        let _ = self
            .metadata()
            .update(&new_id, |e| {
                e.set_etag(created.etag.clone());
                e.set_has_changes(false);
                if e.state() == ItemState::DirtyLocal {
                    e.force_state(ItemState::Hydrated);
                }
            })
            .await;
        info!(old = %id, new = %new_id, "directory created remotely");
        Ok(new_id)
    }

    /// Reloads resumable sessions after a restart.
    ///
    /// The snapshot content is re-read from the content store and
    /// re-verified against the persisted checksum; a mismatch (the
    /// blob changed while we were down) falls back to a fresh snapshot
    /// starting at chunk zero.
    pub async fn restore_persisted(&self) -> Result<usize, CoreError> {
        let sessions = self
            .metadata()
            .resumable_uploads()
            .await
            .map_err(CoreError::from)?;
        let mut restored = 0;
        for mut session in sessions {
            let id = session.id.clone();
            let Ok(data) = self.content.read_all(&id) else {
                warn!(%id, "resumable session has no blob, dropping");
                let _ = self.metadata().delete_upload(&id).await;
                continue;
            };
            let checksum_matches =
                onemount_core::domain::QuickXor::of(&data) == session.quick_xor;
            if checksum_matches {
                session.data = data;
                info!(
                    %id,
                    resume_offset = session.resume_offset(),
                    "resuming persisted upload session"
                );
            } else {
                warn!(%id, "blob changed since checkpoint, restarting upload");
                let entry = self.metadata().get(&id).await.map_err(CoreError::from)?;
                session = UploadSession::snapshot(&entry, data, session.priority);
                self.metadata()
                    .save_upload(&session)
                    .await
                    .map_err(CoreError::from)?;
            }
            self.enqueue(session).await?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Whether any session for `id` is queued or running.
    pub fn is_pending(&self, id: &ItemId) -> bool {
        self.pending.get(id).map(|n| *n > 0).unwrap_or(false)
    }

    /// Cancels the in-flight session for `id`, if any.
    pub fn cancel(&self, id: &ItemId) {
        if let Some(token) = self.active.get(id) {
            token.cancel();
        }
    }

    /// Blocks until every queued session for `id` has settled.
    pub async fn wait(&self, id: &ItemId, deadline: Duration) -> Result<Entry, CoreError> {
        let result = tokio::time::timeout(deadline, async {
            loop {
                let settled = self.settled.notified();
                if !self.is_pending(id) {
                    break;
                }
                settled.await;
            }
        })
        .await;
        if result.is_err() {
            return Err(CoreError::Cancelled);
        }
        let entry = self.metadata().get(id).await.map_err(CoreError::from)?;
        match entry.last_error() {
            Some(err) => Err(CoreError::Io(err.message.clone())),
            None => Ok(entry),
        }
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, label: String) {
        loop {
            let session = match self.queue.pop(&self.shutdown).await {
                Some(s) => s,
                None => return,
            };
            self.process(session, &label).await;
            self.settled.notify_waiters();
        }
    }

    fn serial_lock(&self, id: &ItemId) -> Arc<Mutex<()>> {
        self.serial
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn decrement_pending(&self, id: &ItemId) {
        if let Some(mut n) = self.pending.get_mut(id) {
            *n = n.saturating_sub(1);
        }
    }

    async fn process(&self, mut session: UploadSession, worker: &str) {
        // Low-priority sessions run at bounded parallelism; high and
        // normal only contend for workers.
        let _permit = if session.priority == TransferPriority::Low {
            Some(self.low_permits.clone().acquire_owned().await.expect("semaphore open"))
        } else {
            None
        };

        // Sessions for one item are delivered in order.
        let serial = self.serial_lock(&session.id);
        let _serial = serial.lock().await;

        let id = session.id.clone();
        // The item may have been unlinked while the session sat in the
        // queue; a snapshot for a gone item must not reach the remote.
        match self.metadata().try_get(&id).await {
            Ok(Some(entry)) if entry.state() != ItemState::Deleted => {}
            _ => {
                debug!(%id, "upload session dropped, item gone");
                self.decrement_pending(&id);
                let _ = self.metadata().delete_upload(&id).await;
                return;
            }
        }
        let token = self.shutdown.child_token();
        self.active.insert(id.clone(), token.clone());
        self.events.file_status_changed(&id, FileStatus::Syncing);
        debug!(%id, worker, size = session.size, "upload session started");

        let result = self.run_session(&mut session, &token).await;
        self.active.remove(&id);
        self.decrement_pending(&id);

        match result {
            Ok(remote_item) => self.complete(&id, remote_item).await,
            Err(CoreError::Cancelled) => {
                debug!(%id, "upload cancelled");
                if let Some(url) = session.upload_url.as_deref() {
                    let _ = self.remote.cancel_upload_session(url).await;
                }
                let _ = self.metadata().delete_upload(&id).await;
                self.events
                    .file_status_changed(&id, FileStatus::LocalModified);
            }
            Err(e) => {
                warn!(%id, error = %e, "upload failed terminally");
                let _ = self.metadata().delete_upload(&id).await;
                let temporary = e.is_transient();
                let message = e.to_string();
                let _ = self
                    .metadata()
                    .update(&id, |entry| {
                        entry.set_last_error(Some(ErrorDetails {
                            message: message.clone(),
                            temporary,
                            origin: Some(TransferKind::Upload),
                        }));
                    })
                    .await;
                self.events.error(Some(&id), &message);
                self.events.file_status_changed(&id, FileStatus::Error);
                self.events.metric("uploads_failed", 1.0);
            }
        }
    }

    /// Success bookkeeping: verification already passed.
    async fn complete(&self, id: &ItemId, remote_item: RemoteItem) {
        // First upload of a locally created item: exchange the
        // provisional id for the remote one in every index.
        let final_id = if id.is_local() {
            let new_id = ItemId::remote(remote_item.id.clone());
            match self.metadata().exchange_id(id, &new_id).await {
                Ok(_) => {
                    if let Err(e) = self.content.rekey(id, &new_id) {
                        warn!(%id, error = %e, "blob rekey failed");
                    }
                    for hook in self.exchange_hooks.read().expect("hook lock").iter() {
                        hook(id, &new_id);
                    }
                    self.state.forget(id);
                    info!(old = %id, new = %new_id, "provisional id exchanged");
                    new_id
                }
                Err(e) => {
                    warn!(%id, error = %e, "id exchange failed");
                    id.clone()
                }
            }
        } else {
            id.clone()
        };

        let _ = self
            .metadata()
            .update(&final_id, |entry| {
                entry.set_etag(remote_item.etag.clone());
                if let Some(size) = remote_item.size {
                    entry.set_size(size);
                }
                if let Some(hash) = remote_item
                    .quick_xor
                    .as_deref()
                    .and_then(|h| onemount_core::domain::QuickXor::new(h).ok())
                {
                    entry.set_quick_xor(Some(hash));
                }
                entry.set_last_error(None);
            })
            .await;
        let _ = self.metadata().delete_upload(&final_id).await;

        // A later write may have queued another session; only the last
        // one to drain moves the item out of DirtyLocal.
        if !self.is_pending(&final_id) {
            match self
                .state
                .transition(&final_id, ItemState::Hydrated, TransitionOptions::default())
                .await
            {
                Ok(_) => {}
                Err(CoreError::InvalidTransition { from, .. }) => {
                    debug!(%final_id, from, "upload done but item moved on");
                }
                Err(e) => warn!(%final_id, error = %e, "post-upload transition failed"),
            }
        }
        self.events.metric("uploads_completed", 1.0);
        info!(%final_id, "upload complete");
    }

    // ------------------------------------------------------------------
    // Session execution
    // ------------------------------------------------------------------

    fn target_for(session: &UploadSession) -> UploadTarget {
        match session.id.as_remote() {
            Some(remote_id) => UploadTarget::Item(remote_id.to_string()),
            None => UploadTarget::ChildOf {
                parent_id: session.parent_id.to_string(),
                name: session.name.clone(),
            },
        }
    }

    /// Runs a session with session-level retries, returning the
    /// verified remote item.
    async fn run_session(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> Result<RemoteItem, CoreError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let outcome = if session.is_large() {
                self.upload_large(session, cancel).await
            } else {
                self.upload_small(session, cancel).await
            };
            match outcome {
                Ok(item) => {
                    let item = self.resolve_item(session, item).await?;
                    self.verify(session, &item)?;
                    return Ok(item);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.backoff.max_attempts => {
                    session.retry_count += 1;
                    let _ = self.metadata().save_upload(session).await;
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        id = %session.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "upload attempt failed, backing off"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_small(
        &self,
        session: &UploadSession,
        _cancel: &CancellationToken,
    ) -> Result<Option<RemoteItem>, CoreError> {
        let target = Self::target_for(session);
        let item = self
            .remote
            .put_small(&target, &session.data)
            .await
            .map_err(CoreError::from)?;
        Ok(Some(item))
    }

    async fn upload_large(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> Result<Option<RemoteItem>, CoreError> {
        let target = Self::target_for(session);

        // Session URL creation retries under the same policy as chunks.
        if session.upload_url.is_none() || expired(session) {
            let info = self
                .backoff
                .retry("create upload session", cancel, || {
                    self.remote.create_upload_session(&target)
                })
                .await?;
            session.upload_url = Some(info.upload_url);
            session.url_expiration = info.expiration;
            session.last_successful_chunk = None;
            session.bytes_uploaded = 0;
            self.metadata()
                .save_upload(session)
                .await
                .map_err(CoreError::from)?;
        }
        let url = session.upload_url.clone().expect("session url just ensured");

        let total = session.size;
        let mut offset = session.resume_offset();
        while offset < total {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let len = (total - offset).min(UPLOAD_CHUNK_SIZE);
            let range = ChunkRange {
                offset,
                len,
                total,
            };
            let chunk = &session.data[offset as usize..(offset + len) as usize];
            let index = (offset / UPLOAD_CHUNK_SIZE) as u32;

            let status = self
                .backoff
                .retry("upload chunk", cancel, || {
                    self.remote.put_chunk(&url, range, chunk)
                })
                .await;

            match status {
                Ok(ChunkStatus::Accepted) => {
                    session.record_chunk(index, len);
                    // Checkpoint after every acknowledged chunk so a
                    // crash resumes here, not at byte zero.
                    self.metadata()
                        .save_upload(session)
                        .await
                        .map_err(CoreError::from)?;
                    offset += len;
                }
                Ok(ChunkStatus::Complete(item)) => {
                    session.record_chunk(index, len);
                    let _ = self.metadata().save_upload(session).await;
                    return Ok(item);
                }
                // The session URL itself has gone away (expired or
                // replaced); recreate it and start over.
                Err(CoreError::NotFound(_)) | Err(CoreError::Conflict(_)) => {
                    warn!(id = %session.id, "upload session lost, will recreate");
                    session.upload_url = None;
                    session.can_resume = false;
                    let _ = self.metadata().save_upload(session).await;
                    return Err(CoreError::Transient("upload session lost".into()));
                }
                Err(e) => return Err(e),
            }
        }

        // Entire range acknowledged without a completion body.
        Ok(None)
    }

    /// Fetches the item when the remote reported success with an empty
    /// body, so there is always something to verify against.
    async fn resolve_item(
        &self,
        session: &UploadSession,
        item: Option<RemoteItem>,
    ) -> Result<RemoteItem, CoreError> {
        if let Some(item) = item {
            return Ok(item);
        }
        let item = match Self::target_for(session) {
            UploadTarget::Item(id) => self.remote.get_item(&id).await,
            UploadTarget::ChildOf { parent_id, name } => {
                self.remote.get_child(&parent_id, &name).await
            }
        };
        item.map_err(CoreError::from)
    }

    /// Post-upload verification: QuickXOR match, or size match when
    /// the remote reports no hash.
    fn verify(&self, session: &UploadSession, item: &RemoteItem) -> Result<(), CoreError> {
        match item.quick_xor.as_deref() {
            Some(remote_hash) => {
                if remote_hash != session.quick_xor.as_str() {
                    return Err(CoreError::ChecksumMismatch {
                        expected: session.quick_xor.as_str().to_string(),
                        actual: remote_hash.to_string(),
                    });
                }
            }
            None => {
                if item.size != Some(session.size) {
                    return Err(CoreError::ChecksumMismatch {
                        expected: format!("size {}", session.size),
                        actual: format!("size {:?}", item.size),
                    });
                }
            }
        }
        Ok(())
    }
}

fn expired(session: &UploadSession) -> bool {
    match session.url_expiration {
        Some(expiration) => chrono::Utc::now() >= expiration,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;

    use onemount_cache::DatabasePool;
    use onemount_core::domain::{ItemKind, QuickXor};
    use onemount_core::ports::NullEventSink;

    use crate::testing::FakeRemote;

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<StateManager>,
        content: Arc<ContentStore>,
        remote: Arc<FakeRemote>,
        mgr: Arc<UploadManager>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::in_memory().await.unwrap();
        let metadata = MetadataStore::new(pool);
        let state = Arc::new(StateManager::new(
            metadata,
            Arc::new(NullEventSink),
            Arc::new(AtomicBool::new(true)),
        ));
        let content = Arc::new(ContentStore::new(dir.path(), u64::MAX).unwrap());
        let remote = FakeRemote::new();
        let mgr = UploadManager::new(
            Arc::clone(&state),
            Arc::clone(&content),
            remote.clone(),
            Arc::new(NullEventSink),
            64,
            1,
        );
        mgr.spawn_workers(2);
        Fixture {
            _dir: dir,
            state,
            content,
            remote,
            mgr,
        }
    }

    /// Seeds a dirty file that already exists remotely.
    async fn seed_dirty(fx: &Fixture, id: &str, content: &[u8]) -> ItemId {
        fx.remote.file(id, "ROOT", &format!("{}.bin", id), b"old remote bytes");
        let mut entry = Entry::from_remote(
            ItemId::remote(id),
            ItemId::remote("ROOT"),
            format!("{}.bin", id),
            ItemKind::File,
            content.len() as u64,
            Utc::now(),
            Some("\"etag-old\"".into()),
            None,
        );
        entry.force_state(ItemState::DirtyLocal);
        entry.set_has_changes(true);
        fx.state.metadata().save(&entry).await.unwrap();
        let item_id = ItemId::remote(id);
        fx.content.insert(&item_id, content).unwrap();
        item_id
    }

    /// Seeds a locally created file with a provisional id.
    async fn seed_local(fx: &Fixture, name: &str, content: &[u8]) -> ItemId {
        let entry = Entry::new_local_file(ItemId::remote("ROOT"), name, 0o644);
        let id = entry.id().clone();
        fx.state.metadata().save(&entry).await.unwrap();
        fx.content.insert(&id, content).unwrap();
        id
    }

    #[tokio::test]
    async fn small_upload_updates_entry_and_state() {
        let fx = fixture().await;
        let id = seed_dirty(&fx, "F1", b"one hundred bytes of fresh local content").await;

        fx.mgr.queue(&id, TransferPriority::Normal).await.unwrap();
        let entry = fx.mgr.wait(&id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(entry.state(), ItemState::Hydrated);
        assert!(!entry.has_changes());
        assert_ne!(entry.etag(), Some("\"etag-old\""));
        // Remote received the new bytes.
        assert_eq!(
            fx.remote.contents.get("F1").unwrap().as_slice(),
            b"one hundred bytes of fresh local content"
        );
        // Session row is gone.
        assert!(fx.state.metadata().get_upload(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_upload_sends_ranged_chunks() {
        let fx = fixture().await;
        let payload = vec![0xa5u8; 12 * 1024 * 1024];
        let id = seed_dirty(&fx, "BIG", &payload).await;

        fx.mgr.queue(&id, TransferPriority::Normal).await.unwrap();
        let entry = fx.mgr.wait(&id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(entry.state(), ItemState::Hydrated);

        let chunks = fx.remote.chunks.lock().await;
        let (_, received) = chunks.iter().next().expect("one session");
        let headers: Vec<String> = received.iter().map(|(r, _)| r.header_value()).collect();
        assert_eq!(
            headers,
            vec![
                "bytes 0-10485759/12582912".to_string(),
                "bytes 10485760-12582911/12582912".to_string(),
            ]
        );
        assert_eq!(fx.remote.contents.get("BIG").unwrap().len(), payload.len());
    }

    #[tokio::test]
    async fn local_creation_exchanges_provisional_id() {
        let fx = fixture().await;
        let id = seed_local(&fx, "draft.txt", b"brand new").await;
        assert!(id.is_local());

        let exchanged = Arc::new(std::sync::Mutex::new(None));
        {
            let exchanged = Arc::clone(&exchanged);
            fx.mgr.on_id_exchanged(move |old, new| {
                *exchanged.lock().unwrap() = Some((old.clone(), new.clone()));
            });
        }

        fx.mgr.queue(&id, TransferPriority::High).await.unwrap();
        // Wait keyed on the old id settles once the queue drains.
        fx.mgr.wait(&id, Duration::from_secs(5)).await.ok();

        let (old, new) = exchanged.lock().unwrap().clone().expect("hook ran");
        assert_eq!(old, id);
        assert!(!new.is_local());

        // Old id gone from every store, new id present and hydrated.
        assert!(fx.state.metadata().try_get(&id).await.unwrap().is_none());
        let entry = fx.state.metadata().get(&new).await.unwrap();
        assert_eq!(entry.state(), ItemState::Hydrated);
        assert!(!fx.content.has(&id));
        assert!(fx.content.has(&new));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_put_failures_retry_then_succeed() {
        let fx = fixture().await;
        let id = seed_dirty(&fx, "F1", b"retry me").await;
        fx.remote
            .put_failures
            .store(2, std::sync::atomic::Ordering::SeqCst);

        fx.mgr.queue(&id, TransferPriority::Normal).await.unwrap();
        let entry = fx.mgr.wait(&id, Duration::from_secs(300)).await.unwrap();
        assert_eq!(entry.state(), ItemState::Hydrated);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_item_dirty_with_error() {
        let fx = fixture().await;
        let id = seed_dirty(&fx, "F1", b"never uploads").await;
        fx.remote
            .put_failures
            .store(u32::MAX, std::sync::atomic::Ordering::SeqCst);

        fx.mgr.queue(&id, TransferPriority::Normal).await.unwrap();
        let err = fx.mgr.wait(&id, Duration::from_secs(600)).await.unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));

        // Content preserved, state still DirtyLocal, error recorded.
        let entry = fx.state.metadata().get(&id).await.unwrap();
        assert_eq!(entry.state(), ItemState::DirtyLocal);
        assert!(entry.last_error().is_some());
        assert_eq!(entry.status(Default::default()), FileStatus::Error);
        assert_eq!(fx.content.get(&id).unwrap().unwrap(), b"never uploads");
    }

    #[tokio::test]
    async fn restore_persisted_resumes_at_next_chunk() {
        let fx = fixture().await;
        let payload = vec![0x5au8; 12 * 1024 * 1024];
        let id = seed_dirty(&fx, "BIG", &payload).await;

        // Simulate a crashed process: a checkpointed session with the
        // first chunk acknowledged.
        let entry = fx.state.metadata().get(&id).await.unwrap();
        let mut session =
            UploadSession::snapshot(&entry, payload.clone(), TransferPriority::Normal);
        session.upload_url = Some("fake://upload/item:BIG".into());
        session.record_chunk(0, UPLOAD_CHUNK_SIZE);
        fx.state.metadata().save_upload(&session).await.unwrap();
        // Pre-register the first chunk on the fake remote so assembly
        // completes.
        fx.remote.chunks.lock().await.insert(
            "fake://upload/item:BIG".into(),
            vec![(
                ChunkRange {
                    offset: 0,
                    len: UPLOAD_CHUNK_SIZE,
                    total: payload.len() as u64,
                },
                payload[..UPLOAD_CHUNK_SIZE as usize].to_vec(),
            )],
        );

        let restored = fx.mgr.restore_persisted().await.unwrap();
        assert_eq!(restored, 1);
        let entry = fx.mgr.wait(&id, Duration::from_secs(30)).await.unwrap();
        assert_eq!(entry.state(), ItemState::Hydrated);

        // Only the second chunk crossed the wire after the restart.
        let chunks = fx.remote.chunks.lock().await;
        let received = &chunks["fake://upload/item:BIG"];
        assert_eq!(received.len(), 2);
        assert_eq!(
            received[1].0.header_value(),
            "bytes 10485760-12582911/12582912"
        );
        drop(chunks);

        // Final content matches the snapshot hash.
        assert_eq!(
            fx.remote.items.get("BIG").unwrap().quick_xor.as_deref(),
            Some(QuickXor::of(&payload).as_str())
        );
    }

    #[tokio::test]
    async fn empty_file_uploads() {
        let fx = fixture().await;
        let id = seed_local(&fx, "empty.txt", b"").await;
        fx.mgr.queue(&id, TransferPriority::Normal).await.unwrap();
        fx.mgr.wait(&id, Duration::from_secs(5)).await.ok();
        // The remote minted an id and stored zero bytes.
        let stored = fx
            .remote
            .items
            .iter()
            .find(|i| i.name == "empty.txt")
            .expect("uploaded");
        assert_eq!(stored.size, Some(0));
    }
}
