//! Delta engine: reconciling remote changes into local metadata.
//!
//! A reconciliation pass fetches the next change batch from the
//! persisted cursor, classifies every change against local state, and
//! applies the whole batch (including the new cursor) in one metadata
//! transaction: readers see all of it or none of it, and replaying an
//! already-applied batch is a no-op because every change degenerates
//! to an ETag match.
//!
//! Changes for items that are mid-hydration are parked and re-applied
//! on the next pass once the item settles; conflicts are handed to the
//! resolver and its outcome (metadata batch, remote rename, follow-up
//! transfers) is executed here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::{BatchOp, ContentStore, MetadataStore};
use onemount_conflict::{classify, resolver::overwrite_from_remote, ConflictResolver};
use onemount_core::domain::{
    ConflictInfo, ConflictKind, Entry, ItemId, ItemKind, ItemState, QuickXor, TransferPriority,
    TransitionOptions,
};
use onemount_core::ports::{EventSink, RemoteItem, RemoteStore};
use onemount_core::CoreError;

use crate::backoff::BackoffPolicy;
use crate::download::DownloadManager;
use crate::state::StateManager;
use crate::upload::UploadManager;

/// Result of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaReport {
    /// Changes applied to the metadata store.
    pub applied: usize,
    /// Changes that degenerated to ETag no-ops.
    pub unchanged: usize,
    /// Conflicts detected and resolved.
    pub conflicts: usize,
    /// Changes parked while their item hydrates.
    pub deferred: usize,
}

/// Periodic + webhook-triggered reconciliation.
pub struct DeltaEngine {
    state: Arc<StateManager>,
    content: Arc<ContentStore>,
    remote: Arc<dyn RemoteStore>,
    uploads: Arc<UploadManager>,
    downloads: Arc<DownloadManager>,
    resolver: ConflictResolver,
    events: Arc<dyn EventSink>,
    online: Arc<AtomicBool>,
    /// Remote changes parked while their item was hydrating.
    deferred: Mutex<Vec<RemoteItem>>,
    backoff: BackoffPolicy,
    poll_interval: Duration,
    shutdown: CancellationToken,
    /// Serializes reconciliation passes.
    pass_lock: Mutex<()>,
}

impl DeltaEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateManager>,
        content: Arc<ContentStore>,
        remote: Arc<dyn RemoteStore>,
        uploads: Arc<UploadManager>,
        downloads: Arc<DownloadManager>,
        resolver: ConflictResolver,
        events: Arc<dyn EventSink>,
        online: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            content,
            remote,
            uploads,
            downloads,
            resolver,
            events,
            online,
            deferred: Mutex::new(Vec::new()),
            backoff: BackoffPolicy::default(),
            poll_interval,
            shutdown: CancellationToken::new(),
            pass_lock: Mutex::new(()),
        })
    }

    fn metadata(&self) -> &MetadataStore {
        self.state.metadata()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs until shutdown: a pass every poll interval and on every
    /// webhook trigger, skipped while offline.
    pub async fn run(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
                Some(()) = trigger.recv() => {
                    debug!("delta pass triggered by webhook");
                }
            }
            if !self.online.load(Ordering::Acquire) {
                continue;
            }
            if let Err(e) = self.sync_once().await {
                warn!(error = %e, "delta pass failed");
            }
        }
    }

    /// One reconciliation pass.
    pub async fn sync_once(&self) -> Result<DeltaReport, CoreError> {
        let _pass = self.pass_lock.lock().await;
        let mut report = DeltaReport::default();

        // Changes parked on a previous pass whose items have settled
        // are re-evaluated as if they had just arrived.
        let replayable = self.take_settled_deferred().await?;

        let cursor = self.metadata().delta_cursor().await.map_err(CoreError::from)?;
        let page = self
            .backoff
            .retry("delta fetch", &self.shutdown, || {
                self.remote.get_delta(cursor.as_ref())
            })
            .await?;

        let mut changes = replayable;
        changes.extend(page.changes);

        let mut ops: Vec<BatchOp> = Vec::new();
        // Parent entries touched by child-list maintenance, keyed by id
        // so several changes to one directory coalesce.
        let mut parents: HashMap<ItemId, Entry> = HashMap::new();
        let mut conflicts: Vec<ConflictInfo> = Vec::new();
        let mut purged: Vec<ItemId> = Vec::new();
        let mut ghosted: Vec<ItemId> = Vec::new();

        for change in changes {
            match self
                .plan_change(
                    &change,
                    &mut ops,
                    &mut parents,
                    &mut conflicts,
                    &mut purged,
                    &mut ghosted,
                )
                .await?
            {
                Planned::Applied => report.applied += 1,
                Planned::Unchanged => report.unchanged += 1,
                Planned::Deferred => {
                    report.deferred += 1;
                    self.deferred.lock().await.push(change);
                }
                Planned::Conflict => report.conflicts += 1,
            }
        }

        for parent in parents.into_values() {
            ops.push(BatchOp::Save(parent));
        }
        ops.push(BatchOp::SaveCursor(page.next_cursor));
        self.metadata()
            .apply_batch(ops)
            .await
            .map_err(CoreError::from)?;

        // Blob cleanup and waiter wakeup happen after the batch is
        // visible.
        for id in &purged {
            let _ = self.content.delete(id);
            self.state.wake(id);
            self.state.forget(id);
        }
        for id in &ghosted {
            let _ = self.content.delete(id);
            self.state.wake(id);
        }

        for conflict in conflicts {
            self.resolve_conflict(conflict).await?;
        }

        if report.applied > 0 || report.conflicts > 0 {
            info!(
                applied = report.applied,
                unchanged = report.unchanged,
                conflicts = report.conflicts,
                deferred = report.deferred,
                "delta pass complete"
            );
        }
        self.events.metric("delta_changes_applied", report.applied as f64);
        Ok(report)
    }

    /// Pops deferred changes whose items are no longer hydrating.
    async fn take_settled_deferred(&self) -> Result<Vec<RemoteItem>, CoreError> {
        let mut deferred = self.deferred.lock().await;
        if deferred.is_empty() {
            return Ok(Vec::new());
        }
        let mut ready = Vec::new();
        let mut keep = Vec::new();
        for change in deferred.drain(..) {
            let id = ItemId::remote(change.id.clone());
            let still_hydrating = self
                .metadata()
                .try_get(&id)
                .await
                .map_err(CoreError::from)?
                .map(|e| e.state() == ItemState::Hydrating)
                .unwrap_or(false);
            if still_hydrating {
                keep.push(change);
            } else {
                ready.push(change);
            }
        }
        *deferred = keep;
        Ok(ready)
    }

    async fn plan_change(
        &self,
        change: &RemoteItem,
        ops: &mut Vec<BatchOp>,
        parents: &mut HashMap<ItemId, Entry>,
        conflicts: &mut Vec<ConflictInfo>,
        purged: &mut Vec<ItemId>,
        ghosted: &mut Vec<ItemId>,
    ) -> Result<Planned, CoreError> {
        let id = ItemId::remote(change.id.clone());
        let local = self.metadata().try_get(&id).await.map_err(CoreError::from)?;

        // The feed includes the drive root itself; track it with the
        // sentinel parent.
        if change.parent_id.is_none() && change.is_directory && !change.is_deleted {
            if local.is_none() {
                let root = Entry::from_remote(
                    id,
                    ItemId::sentinel(),
                    change.name.clone(),
                    ItemKind::Directory,
                    0,
                    change.mtime.unwrap_or_else(chrono::Utc::now),
                    change.etag.clone(),
                    None,
                );
                ops.push(BatchOp::Save(root));
                return Ok(Planned::Applied);
            }
            return Ok(Planned::Unchanged);
        }

        match local {
            None => {
                if change.is_deleted {
                    // Never seen locally; nothing to do.
                    return Ok(Planned::Unchanged);
                }
                // New remote child arrives as a ghost.
                let entry = Entry::from_remote(
                    id.clone(),
                    change
                        .parent_id
                        .as_deref()
                        .map(ItemId::remote)
                        .unwrap_or_else(ItemId::sentinel),
                    change.name.clone(),
                    if change.is_directory {
                        ItemKind::Directory
                    } else {
                        ItemKind::File
                    },
                    change.size.unwrap_or(0),
                    change.mtime.unwrap_or_else(chrono::Utc::now),
                    change.etag.clone(),
                    change
                        .quick_xor
                        .as_deref()
                        .and_then(|h| QuickXor::new(h).ok()),
                );
                self.link_parent(parents, entry.parent_id(), &id).await?;
                ops.push(BatchOp::Save(entry));
                Ok(Planned::Applied)
            }
            Some(local) => {
                // Journal-pending items conflict on any real remote
                // movement, whatever their current state.
                let journal_pending = self
                    .metadata()
                    .has_offline_changes(&id)
                    .await
                    .map_err(CoreError::from)?;

                if !change.is_deleted
                    && local.etag().is_some()
                    && local.etag() == change.etag.as_deref()
                {
                    return Ok(Planned::Unchanged);
                }

                if local.state() == ItemState::Hydrating {
                    debug!(%id, "delta deferred while hydrating");
                    return Ok(Planned::Deferred);
                }

                let kind = classify(&local, change, None).or_else(|| {
                    journal_pending.then_some(ConflictKind::Content)
                });
                if let Some(kind) = kind {
                    conflicts.push(ConflictInfo {
                        local: local.clone(),
                        remote: change.clone(),
                        change: None,
                        kind,
                    });
                    return Ok(Planned::Conflict);
                }

                if change.is_deleted {
                    self.unlink_parent(parents, local.parent_id(), &id).await?;
                    ops.push(BatchOp::Delete(id.clone()));
                    purged.push(id);
                    return Ok(Planned::Applied);
                }

                // Remote-only change: overwrite metadata; cached
                // content is stale, so a hydrated copy returns to
                // ghost.
                let old_parent = local.parent_id().clone();
                let mut updated = local;
                overwrite_from_remote(&mut updated, change);
                if updated.parent_id() != &old_parent {
                    self.unlink_parent(parents, &old_parent, &id).await?;
                    self.link_parent(parents, &updated.parent_id().clone(), &id)
                        .await?;
                }
                if updated.state() == ItemState::Hydrated && !updated.is_virtual() {
                    updated.force_state(ItemState::Ghost);
                    ghosted.push(id.clone());
                }
                ops.push(BatchOp::Save(updated));
                Ok(Planned::Applied)
            }
        }
    }

    async fn link_parent(
        &self,
        parents: &mut HashMap<ItemId, Entry>,
        parent_id: &ItemId,
        child: &ItemId,
    ) -> Result<(), CoreError> {
        if parent_id.is_sentinel() {
            return Ok(());
        }
        if let Some(parent) = self.load_parent(parents, parent_id).await? {
            parent.add_child(child.clone());
        }
        Ok(())
    }

    async fn unlink_parent(
        &self,
        parents: &mut HashMap<ItemId, Entry>,
        parent_id: &ItemId,
        child: &ItemId,
    ) -> Result<(), CoreError> {
        if parent_id.is_sentinel() {
            return Ok(());
        }
        if let Some(parent) = self.load_parent(parents, parent_id).await? {
            parent.remove_child(child);
        }
        Ok(())
    }

    async fn load_parent<'a>(
        &self,
        parents: &'a mut HashMap<ItemId, Entry>,
        parent_id: &ItemId,
    ) -> Result<Option<&'a mut Entry>, CoreError> {
        if !parents.contains_key(parent_id) {
            match self
                .metadata()
                .try_get(parent_id)
                .await
                .map_err(CoreError::from)?
            {
                Some(parent) => {
                    parents.insert(parent_id.clone(), parent);
                }
                // Parent not tracked yet (its own change may be later
                // in the feed); the child row's parent_id column still
                // links them.
                None => return Ok(None),
            }
        }
        Ok(parents.get_mut(parent_id))
    }

    /// Executes a resolver outcome. Also used by the sync manager for
    /// conflicts surfaced during journal replay.
    pub async fn resolve_conflict(&self, conflict: ConflictInfo) -> Result<(), CoreError> {
        let id = conflict.local.id().clone();
        warn!(%id, kind = ?conflict.kind, "conflict detected");
        self.events.metric("conflicts_detected", 1.0);

        // Surface the conflict state where the transition is legal
        // (dirty items); journal-only conflicts skip straight to
        // resolution.
        let _ = self
            .state
            .transition(&id, ItemState::Conflict, TransitionOptions::default())
            .await;

        let outcome = self.resolver.resolve(&conflict, chrono::Utc::now());

        if let Some((remote_id, new_name)) = &outcome.remote_rename {
            let parent = conflict
                .remote
                .parent_id
                .clone()
                .or_else(|| conflict.local.parent_id().as_remote().map(String::from))
                .unwrap_or_default();
            self.backoff
                .retry("conflict rename", &self.shutdown, || {
                    self.remote.rename(remote_id, new_name, &parent)
                })
                .await?;
        }
        if let Some((old, new)) = &outcome.rekey {
            self.content.rekey(old, new).map_err(CoreError::from)?;
        }
        self.metadata()
            .apply_batch(outcome.ops)
            .await
            .map_err(CoreError::from)?;
        self.state.wake(&id);

        if let Some(upload_id) = &outcome.needs_upload {
            self.uploads
                .queue(upload_id, TransferPriority::High)
                .await?;
        }
        for hydrate_id in &outcome.needs_hydration {
            self.downloads
                .request(hydrate_id, TransferPriority::Normal)
                .await;
        }
        Ok(())
    }
}

enum Planned {
    Applied,
    Unchanged,
    Deferred,
    Conflict,
}
