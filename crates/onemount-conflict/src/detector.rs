//! Conflict classification.

use onemount_core::domain::{ConflictKind, Entry, ItemState, OfflineChange, OfflineChangeKind};
use onemount_core::ports::RemoteItem;

/// Classifies a remote change colliding with local state.
///
/// Returns `None` when there is no conflict: the remote version
/// matches what the local entry was based on, and any local dirty
/// content can simply be uploaded over it.
pub fn classify(
    local: &Entry,
    remote: &RemoteItem,
    change: Option<&OfflineChange>,
) -> Option<ConflictKind> {
    let locally_dirty = local.state() == ItemState::DirtyLocal
        || local.has_changes()
        || matches!(
            change.map(|c| c.kind),
            Some(OfflineChangeKind::Modify) | Some(OfflineChangeKind::Create)
        );
    let locally_deleted = local.state() == ItemState::Deleted
        || matches!(change.map(|c| c.kind), Some(OfflineChangeKind::Delete));

    // Delete on one side, modification on the other.
    if remote.is_deleted {
        if locally_dirty {
            return Some(ConflictKind::DeleteVsModify);
        }
        return None;
    }
    if locally_deleted {
        if local.etag() != remote.etag.as_deref() {
            return Some(ConflictKind::DeleteVsModify);
        }
        return None;
    }

    // The remote did not move since our base version: no conflict,
    // whatever the local side did.
    if local.etag().is_some() && local.etag() == remote.etag.as_deref() {
        return None;
    }

    if !locally_dirty {
        // Remote-only change; reconciliation handles it without a
        // conflict.
        let renamed = matches!(change.map(|c| c.kind), Some(OfflineChangeKind::Rename));
        if renamed {
            return Some(ConflictKind::Metadata);
        }
        return None;
    }

    // Both sides touched it. Same content hash means only metadata
    // diverged.
    let local_hash = local.quick_xor().map(|h| h.as_str());
    if local_hash.is_some() && local_hash == remote.quick_xor.as_deref() {
        return Some(ConflictKind::Metadata);
    }
    Some(ConflictKind::Content)
}
