//! Conflict resolution.
//!
//! The resolver is pure: it maps a conflict and a policy to a
//! [`ResolutionOutcome`] describing what must happen. The caller (the
//! delta engine or the sync manager) applies the metadata batch
//! transactionally, performs the remote rename when one is required,
//! rekeys the content store, and schedules the follow-up transfers.
//! Resolution always converges on the winning content cached locally
//! with a fresh remote ETag: the local winner goes back through the
//! upload pipeline, the remote winner through hydration.

use chrono::{DateTime, Utc};
use tracing::debug;

use onemount_cache::BatchOp;
use onemount_core::domain::{
    ConflictInfo, ConflictKind, ConflictPolicy, Entry, ItemId, ItemKind, ItemState, QuickXor,
};
use onemount_core::ports::RemoteItem;

use crate::namer::ConflictNamer;

/// What a resolution requires of the caller.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// Metadata operations, applied in one transaction.
    pub ops: Vec<BatchOp>,
    /// Content-store rekey (old id → new id) to perform before `ops`.
    pub rekey: Option<(ItemId, ItemId)>,
    /// Remote rename (remote id, new name) to perform before `ops`.
    pub remote_rename: Option<(String, String)>,
    /// Item whose local content must be re-uploaded.
    pub needs_upload: Option<ItemId>,
    /// Items whose content must be re-hydrated.
    pub needs_hydration: Vec<ItemId>,
}

/// Applies a configured policy to detected conflicts.
pub struct ConflictResolver {
    default_policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(default_policy: ConflictPolicy) -> Self {
        Self { default_policy }
    }

    /// Resolves under the configured policy, falling back to the
    /// item's overlay policy where the configured one is not decisive.
    pub fn resolve(&self, conflict: &ConflictInfo, now: DateTime<Utc>) -> ResolutionOutcome {
        let policy = match self.default_policy {
            ConflictPolicy::LastWriterWins => self.last_writer(conflict),
            other => other,
        };
        debug!(
            id = %conflict.local.id(),
            kind = ?conflict.kind,
            ?policy,
            "resolving conflict"
        );
        match policy {
            ConflictPolicy::KeepBoth => self.keep_both(conflict, now),
            ConflictPolicy::LocalWins => self.local_wins(conflict),
            ConflictPolicy::RemoteWins => self.remote_wins(conflict),
            ConflictPolicy::LastWriterWins => unreachable!("mapped above"),
        }
    }

    /// LastWriterWins collapses to a fixed winner by mtime; ties and
    /// missing remote mtimes fall back to the item's overlay policy.
    fn last_writer(&self, conflict: &ConflictInfo) -> ConflictPolicy {
        match conflict.remote.mtime {
            Some(remote_mtime) if remote_mtime > conflict.local.mtime() => {
                ConflictPolicy::RemoteWins
            }
            Some(remote_mtime) if remote_mtime < conflict.local.mtime() => {
                ConflictPolicy::LocalWins
            }
            _ => ConflictPolicy::from_overlay(conflict.local.overlay_policy()),
        }
    }

    /// Local file keeps its name; the remote version is re-introduced
    /// as a ghost under a conflict-copy name.
    ///
    /// Both items end hydrated: the remote copy through hydration, the
    /// local one through its re-upload. Because the remote id now
    /// belongs to the conflict copy, the local winner is rekeyed to a
    /// fresh provisional id and uploaded as a new item.
    fn keep_both(&self, conflict: &ConflictInfo, now: DateTime<Utc>) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();
        let local = &conflict.local;

        if conflict.remote.is_deleted {
            // Nothing remote to keep; degenerate to local-wins.
            return self.local_wins(conflict);
        }

        let conflict_name = ConflictNamer::conflict_name(local.name(), now);

        // The remote item is renamed out of the way, then tracked as a
        // fresh ghost under the conflict-copy name. Its id usually IS
        // the conflicted item's id, so the old row must go first: the
        // batch applies in order.
        outcome.remote_rename = Some((conflict.remote.id.clone(), conflict_name.clone()));
        let remote_copy = ghost_from_remote(&conflict.remote, local, conflict_name);
        if local.id() != remote_copy.id() {
            outcome.ops.push(BatchOp::Delete(local.id().clone()));
        }
        outcome.needs_hydration.push(remote_copy.id().clone());
        outcome.ops.push(BatchOp::Save(remote_copy));

        // The local winner becomes a new item under the original name.
        let new_id = ItemId::new_local();
        let mut winner = local.clone();
        winner.set_id(new_id.clone());
        winner.set_etag(None);
        winner.force_state(ItemState::DirtyLocal);
        winner.set_has_changes(true);
        outcome.rekey = Some((local.id().clone(), new_id.clone()));
        outcome.ops.push(BatchOp::Save(winner));
        outcome.needs_upload = Some(new_id);
        outcome
    }

    /// The local snapshot wins; the remote version is discarded by
    /// uploading over it.
    fn local_wins(&self, conflict: &ConflictInfo) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();
        let local = &conflict.local;

        if conflict.remote.is_deleted {
            // The remote item is gone; recreate it from local content
            // under a fresh provisional id.
            let new_id = ItemId::new_local();
            let mut winner = local.clone();
            winner.set_id(new_id.clone());
            winner.set_etag(None);
            winner.force_state(ItemState::DirtyLocal);
            winner.set_has_changes(true);
            outcome.rekey = Some((local.id().clone(), new_id.clone()));
            outcome.ops.push(BatchOp::Delete(local.id().clone()));
            outcome.ops.push(BatchOp::Save(winner));
            outcome.needs_upload = Some(new_id);
            return outcome;
        }

        let mut winner = local.clone();
        // Adopt the remote etag as the new base so the upload replaces
        // exactly the version we resolved against.
        winner.set_etag(conflict.remote.etag.clone());
        winner.force_state(ItemState::DirtyLocal);
        winner.set_has_changes(true);
        outcome.needs_upload = Some(winner.id().clone());
        outcome.ops.push(BatchOp::Save(winner));
        outcome
    }

    /// The remote snapshot wins; local content is discarded and the
    /// item re-hydrates from the remote.
    fn remote_wins(&self, conflict: &ConflictInfo) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();
        let local = &conflict.local;

        if conflict.remote.is_deleted {
            outcome.ops.push(BatchOp::Delete(local.id().clone()));
            return outcome;
        }

        let mut winner = local.clone();
        overwrite_from_remote(&mut winner, &conflict.remote);
        winner.force_state(ItemState::Ghost);
        winner.set_has_changes(false);
        outcome.needs_hydration.push(winner.id().clone());
        outcome.ops.push(BatchOp::Save(winner));
        outcome
    }
}

/// Builds a ghost entry tracking `remote` under `name`, parented like
/// the conflicted local item.
fn ghost_from_remote(remote: &RemoteItem, local: &Entry, name: String) -> Entry {
    Entry::from_remote(
        ItemId::remote(remote.id.clone()),
        local.parent_id().clone(),
        name,
        if remote.is_directory {
            ItemKind::Directory
        } else {
            ItemKind::File
        },
        remote.size.unwrap_or(0),
        remote.mtime.unwrap_or_else(Utc::now),
        remote.etag.clone(),
        remote
            .quick_xor
            .as_deref()
            .and_then(|h| QuickXor::new(h).ok()),
    )
}

/// Overwrites an entry's remote-facing metadata in place.
pub fn overwrite_from_remote(entry: &mut Entry, remote: &RemoteItem) {
    entry.set_name(remote.name.clone());
    if let Some(parent) = remote.parent_id.as_deref() {
        entry.set_parent_id(ItemId::remote(parent));
    }
    if let Some(size) = remote.size {
        entry.set_size(size);
    }
    if let Some(mtime) = remote.mtime {
        entry.set_mtime(mtime);
    }
    entry.set_etag(remote.etag.clone());
    entry.set_quick_xor(
        remote
            .quick_xor
            .as_deref()
            .and_then(|h| QuickXor::new(h).ok()),
    );
}
