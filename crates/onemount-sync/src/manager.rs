//! Sync manager: journal replay on reconnect.
//!
//! Processes the offline journal in sequence order. Every step fetches
//! the current remote state for its item, compares it with the
//! journaled intent, and either performs the corresponding remote
//! operation, skips it as already reflected, or hands a mismatch to
//! the conflict resolver. Steps retry transient failures under the
//! shared backoff policy; terminal failures are collected into the
//! report without aborting the remaining journal.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::MetadataStore;
use onemount_core::domain::{
    ConflictInfo, ConflictKind, Entry, OfflineChange, OfflineChangeKind, QuickXor,
    TransferPriority,
};
use onemount_core::ports::{EventSink, RemoteError, RemoteItem, RemoteStore};
use onemount_core::CoreError;

use crate::backoff::BackoffPolicy;
use crate::delta::DeltaEngine;
use crate::state::StateManager;
use crate::upload::UploadManager;

/// Outcome of one journal replay.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Changes replayed against the remote.
    pub replayed: usize,
    /// Changes the remote already reflected.
    pub skipped: usize,
    /// Changes that resolved as conflicts.
    pub conflicts: usize,
    /// Terminal failures, by journal sequence number.
    pub failures: Vec<(i64, String)>,
}

/// Replays the offline journal when connectivity returns.
pub struct SyncManager {
    state: Arc<StateManager>,
    remote: Arc<dyn RemoteStore>,
    uploads: Arc<UploadManager>,
    delta: Arc<DeltaEngine>,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
}

impl SyncManager {
    pub fn new(
        state: Arc<StateManager>,
        remote: Arc<dyn RemoteStore>,
        uploads: Arc<UploadManager>,
        delta: Arc<DeltaEngine>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            remote,
            uploads,
            delta,
            events,
            backoff: BackoffPolicy::default(),
            shutdown: CancellationToken::new(),
        })
    }

    fn metadata(&self) -> &MetadataStore {
        self.state.metadata()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs until shutdown, replaying the journal on every
    /// reconnection edge.
    pub async fn run(self: Arc<Self>, reconnected: Arc<Notify>) {
        loop {
            let notified = reconnected.notified();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = notified => {}
            }
            let report = self.replay_journal().await;
            info!(
                replayed = report.replayed,
                skipped = report.skipped,
                conflicts = report.conflicts,
                failures = report.failures.len(),
                "journal replay finished"
            );
        }
    }

    /// Replays the whole journal in order, collecting failures.
    pub async fn replay_journal(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let changes = match self.metadata().offline_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "cannot read offline journal");
                return report;
            }
        };

        for change in changes {
            let seq = change.seq;
            match self.replay_one(&change).await {
                Ok(outcome) => {
                    match outcome {
                        ReplayOutcome::Replayed => report.replayed += 1,
                        ReplayOutcome::Skipped => report.skipped += 1,
                        ReplayOutcome::Conflict => report.conflicts += 1,
                    }
                    if let Err(e) = self.metadata().remove_offline_change(seq).await {
                        warn!(seq, error = %e, "replayed change could not be removed");
                    }
                }
                Err(e) => {
                    warn!(seq, error = %e, "journal replay step failed");
                    self.events.error(None, &format!("offline replay: {}", e));
                    report.failures.push((seq, e.to_string()));
                }
            }
        }
        self.events
            .metric("journal_replayed", report.replayed as f64);
        report
    }

    async fn replay_one(&self, change: &OfflineChange) -> Result<ReplayOutcome, CoreError> {
        debug!(seq = change.seq, kind = ?change.kind, id = %change.id, "replaying change");
        match change.kind {
            OfflineChangeKind::Create | OfflineChangeKind::Modify => {
                self.replay_upload(change).await
            }
            OfflineChangeKind::Delete => self.replay_delete(change).await,
            OfflineChangeKind::Rename => self.replay_rename(change).await,
        }
    }

    /// Create/Modify replay: upload unless the remote already has the
    /// journaled content, conflict when the remote moved meanwhile.
    async fn replay_upload(&self, change: &OfflineChange) -> Result<ReplayOutcome, CoreError> {
        let Some(entry) = self
            .metadata()
            .try_get(&change.id)
            .await
            .map_err(CoreError::from)?
        else {
            // Deleted again before we got back online; the delete has
            // its own journal row.
            return Ok(ReplayOutcome::Skipped);
        };

        if entry.is_directory() {
            if entry.id().is_local() {
                self.backoff
                    .retry("replay mkdir", &self.shutdown, || async {
                        self.uploads.sync_folder(entry.id()).await.map_err(to_remote)
                    })
                    .await?;
                return Ok(ReplayOutcome::Replayed);
            }
            return Ok(ReplayOutcome::Skipped);
        }

        // Compare with the current remote state.
        match self.fetch_remote(&entry).await? {
            Some(remote) => {
                if remote.quick_xor.as_deref()
                    == entry.quick_xor().map(QuickXor::as_str)
                    && remote.quick_xor.is_some()
                {
                    // Already reflected (an earlier replay crashed
                    // after uploading).
                    return Ok(ReplayOutcome::Skipped);
                }
                if entry.etag().is_some() && remote.etag.as_deref() != entry.etag() {
                    // The remote moved while we were offline.
                    self.delta
                        .resolve_conflict(ConflictInfo {
                            kind: ConflictKind::Content,
                            local: entry,
                            remote,
                            change: Some(change.clone()),
                        })
                        .await?;
                    return Ok(ReplayOutcome::Conflict);
                }
            }
            None => {
                if !entry.id().is_local() {
                    // We hold content for an item the remote deleted.
                    let remote = deleted_marker(&entry);
                    self.delta
                        .resolve_conflict(ConflictInfo {
                            kind: ConflictKind::DeleteVsModify,
                            local: entry,
                            remote,
                            change: Some(change.clone()),
                        })
                        .await?;
                    return Ok(ReplayOutcome::Conflict);
                }
            }
        }

        self.uploads
            .queue(&change.id, TransferPriority::Normal)
            .await?;
        Ok(ReplayOutcome::Replayed)
    }

    /// Delete replay: idempotent against an already-gone remote item.
    async fn replay_delete(&self, change: &OfflineChange) -> Result<ReplayOutcome, CoreError> {
        let Some(remote_id) = change.id.as_remote() else {
            // Never uploaded; nothing exists remotely.
            return Ok(ReplayOutcome::Skipped);
        };
        let result = self
            .backoff
            .retry("replay delete", &self.shutdown, || {
                self.remote.delete(remote_id)
            })
            .await;
        match result {
            Ok(()) => Ok(ReplayOutcome::Replayed),
            Err(CoreError::NotFound(_)) => Ok(ReplayOutcome::Skipped),
            Err(e) => Err(e),
        }
    }

    /// Rename replay: the local entry already carries the intended
    /// name and parent.
    async fn replay_rename(&self, change: &OfflineChange) -> Result<ReplayOutcome, CoreError> {
        let Some(entry) = self
            .metadata()
            .try_get(&change.id)
            .await
            .map_err(CoreError::from)?
        else {
            return Ok(ReplayOutcome::Skipped);
        };
        let Some(remote_id) = entry.id().as_remote() else {
            // A local-only item renames implicitly when it uploads.
            return Ok(ReplayOutcome::Skipped);
        };
        let Some(parent_id) = entry.parent_id().as_remote() else {
            return Err(CoreError::Transient(
                "rename target parent not yet created remotely".to_string(),
            ));
        };

        match self.fetch_remote(&entry).await? {
            Some(remote) => {
                let already = remote.name.to_lowercase() == entry.name().to_lowercase()
                    && remote.parent_id.as_deref() == Some(parent_id);
                if already {
                    return Ok(ReplayOutcome::Skipped);
                }
            }
            None => {
                let remote = deleted_marker(&entry);
                self.delta
                    .resolve_conflict(ConflictInfo {
                        kind: ConflictKind::DeleteVsModify,
                        local: entry,
                        remote,
                        change: Some(change.clone()),
                    })
                    .await?;
                return Ok(ReplayOutcome::Conflict);
            }
        }

        let name = entry.name().to_string();
        self.backoff
            .retry("replay rename", &self.shutdown, || {
                self.remote.rename(remote_id, &name, parent_id)
            })
            .await?;
        Ok(ReplayOutcome::Replayed)
    }

    /// Current remote state of an entry; `None` if it does not exist.
    async fn fetch_remote(&self, entry: &Entry) -> Result<Option<RemoteItem>, CoreError> {
        let result = match entry.id().as_remote() {
            Some(remote_id) => {
                self.backoff
                    .retry("fetch remote state", &self.shutdown, || {
                        self.remote.get_item(remote_id)
                    })
                    .await
            }
            None => {
                let Some(parent) = entry.parent_id().as_remote() else {
                    return Ok(None);
                };
                let name = entry.name().to_string();
                let parent = parent.to_string();
                self.backoff
                    .retry("fetch remote state", &self.shutdown, || {
                        self.remote.get_child(&parent, &name)
                    })
                    .await
            }
        };
        match result {
            Ok(item) => Ok(Some(item)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

enum ReplayOutcome {
    Replayed,
    Skipped,
    Conflict,
}

/// Synthesizes a deleted-item marker for conflict classification.
fn deleted_marker(entry: &Entry) -> RemoteItem {
    RemoteItem {
        id: entry
            .id()
            .as_remote()
            .unwrap_or_default()
            .to_string(),
        name: entry.name().to_string(),
        size: None,
        etag: None,
        quick_xor: None,
        mtime: None,
        is_directory: entry.is_directory(),
        is_deleted: true,
        parent_id: entry.parent_id().as_remote().map(String::from),
    }
}

/// Adapts engine errors into the transient/fatal split the backoff
/// loop understands.
fn to_remote(e: CoreError) -> RemoteError {
    if e.is_transient() {
        RemoteError::Transient(e.to_string())
    } else {
        RemoteError::Fatal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use onemount_cache::{ContentStore, DatabasePool};
    use onemount_conflict::ConflictResolver;
    use onemount_core::domain::{ConflictPolicy, ItemId, ItemKind, ItemState};
    use onemount_core::ports::NullEventSink;

    use crate::download::DownloadManager;
    use crate::testing::FakeRemote;

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<StateManager>,
        content: Arc<ContentStore>,
        remote: Arc<FakeRemote>,
        uploads: Arc<UploadManager>,
        mgr: Arc<SyncManager>,
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
        let uploads = UploadManager::new(
            Arc::clone(&state),
            Arc::clone(&content),
            remote.clone(),
            Arc::new(NullEventSink),
            64,
            1,
        );
        uploads.spawn_workers(1);
        let downloads = DownloadManager::new(
            Arc::clone(&state),
            Arc::clone(&content),
            remote.clone(),
            Arc::new(NullEventSink),
        );
        downloads.spawn_workers(1);
        let delta = DeltaEngine::new(
            Arc::clone(&state),
            Arc::clone(&content),
            remote.clone(),
            Arc::clone(&uploads),
            downloads,
            ConflictResolver::new(ConflictPolicy::KeepBoth),
            Arc::new(NullEventSink),
            Arc::new(AtomicBool::new(true)),
            Duration::from_secs(3600),
        );
        let mgr = SyncManager::new(
            Arc::clone(&state),
            remote.clone(),
            Arc::clone(&uploads),
            delta,
            Arc::new(NullEventSink),
        );
        Fixture {
            _dir: dir,
            state,
            content,
            remote,
            uploads,
            mgr,
        }
    }

    #[tokio::test]
    async fn offline_create_and_modify_replay_as_upload() {
        let fx = fixture().await;

        // Offline: /d.txt created and written locally, journaled.
        let entry = Entry::new_local_file(ItemId::remote("ROOT"), "d.txt", 0o644);
        let id = entry.id().clone();
        fx.state.metadata().save(&entry).await.unwrap();
        fx.content.insert(&id, b"x").unwrap();
        let mut c1 = OfflineChange::new(id.clone(), OfflineChangeKind::Create, "/d.txt");
        let mut c2 = OfflineChange::new(id.clone(), OfflineChangeKind::Modify, "/d.txt");
        fx.state.metadata().append_offline_change(&mut c1).await.unwrap();
        fx.state.metadata().append_offline_change(&mut c2).await.unwrap();

        // Online again: replay.
        let report = fx.mgr.replay_journal().await;
        assert!(report.failures.is_empty());
        assert_eq!(report.conflicts, 0);

        // The upload drains; remote now has "x".
        fx.uploads.wait(&id, Duration::from_secs(5)).await.ok();
        let uploaded = fx
            .remote
            .items
            .iter()
            .find(|i| i.name == "d.txt")
            .expect("remote file exists");
        assert_eq!(
            fx.remote.contents.get(&uploaded.id).unwrap().as_slice(),
            b"x"
        );
        // Journal is drained.
        assert!(fx.state.metadata().offline_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_delete_is_idempotent() {
        let fx = fixture().await;
        // The item exists remotely and was deleted locally offline.
        fx.remote.file("F1", "ROOT", "gone.txt", b"bye");
        let mut c = OfflineChange::new(
            ItemId::remote("F1"),
            OfflineChangeKind::Delete,
            "/gone.txt",
        );
        fx.state.metadata().append_offline_change(&mut c).await.unwrap();

        let report = fx.mgr.replay_journal().await;
        assert_eq!(report.replayed, 1);
        assert!(!fx.remote.items.contains_key("F1"));

        // A second replay of the same intent is a no-op.
        let mut c = OfflineChange::new(
            ItemId::remote("F1"),
            OfflineChangeKind::Delete,
            "/gone.txt",
        );
        fx.state.metadata().append_offline_change(&mut c).await.unwrap();
        let report = fx.mgr.replay_journal().await;
        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn replay_rename_applies_and_skips_when_reflected() {
        let fx = fixture().await;
        fx.remote.file("F1", "ROOT", "old.txt", b"data");
        let mut entry = Entry::from_remote(
            ItemId::remote("F1"),
            ItemId::remote("ROOT"),
            "new.txt",
            ItemKind::File,
            4,
            Utc::now(),
            Some("\"etag-F1-1\"".into()),
            None,
        );
        entry.force_state(ItemState::Hydrated);
        fx.state.metadata().save(&entry).await.unwrap();

        let mut c = OfflineChange::rename(ItemId::remote("F1"), "/old.txt", "/new.txt");
        fx.state.metadata().append_offline_change(&mut c).await.unwrap();

        let report = fx.mgr.replay_journal().await;
        assert_eq!(report.replayed, 1);
        assert_eq!(fx.remote.items.get("F1").unwrap().name, "new.txt");

        // Replaying the same rename again skips.
        let mut c = OfflineChange::rename(ItemId::remote("F1"), "/old.txt", "/new.txt");
        fx.state.metadata().append_offline_change(&mut c).await.unwrap();
        let report = fx.mgr.replay_journal().await;
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn concurrent_remote_modification_resolves_as_conflict() {
        let fx = fixture().await;

        // Remote has e.txt at etag v2 (modified while we were away);
        // local copy is based on v1 and dirty.
        fx.remote.file("F1", "ROOT", "e.txt", b"remote edit");
        let mut entry = Entry::from_remote(
            ItemId::remote("F1"),
            ItemId::remote("ROOT"),
            "e.txt",
            ItemKind::File,
            10,
            Utc::now(),
            Some("\"stale-base\"".into()),
            Some(QuickXor::of(b"local edit")),
        );
        entry.force_state(ItemState::DirtyLocal);
        entry.set_has_changes(true);
        fx.state.metadata().save(&entry).await.unwrap();
        fx.content
            .insert(&ItemId::remote("F1"), b"local edit")
            .unwrap();

        let mut c = OfflineChange::new(ItemId::remote("F1"), OfflineChangeKind::Modify, "/e.txt");
        fx.state.metadata().append_offline_change(&mut c).await.unwrap();

        let report = fx.mgr.replay_journal().await;
        assert_eq!(report.conflicts, 1);
        assert!(report.failures.is_empty());

        // KeepBoth: the remote copy is now tracked under a conflict
        // name; the local winner keeps /e.txt.
        let all = fx.state.metadata().all_entries().await.unwrap();
        assert!(all.iter().any(|e| e.name().contains("-conflict-")));
        assert!(all.iter().any(|e| e.name() == "e.txt"));
    }
}
