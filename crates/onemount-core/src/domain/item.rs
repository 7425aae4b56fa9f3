//! The item record.
//!
//! [`Entry`] is the unit of storage: one per file or directory, owned
//! authoritatively by the metadata store and indexed (by id) everywhere
//! else. It carries the remote-facing attributes (etag, QuickXOR,
//! size), the kernel-facing attributes (name, mode, mtime, xattrs),
//! the placement [`ItemState`] and the bookkeeping that survives a
//! crash: hydration and upload contexts, the last error, and the
//! per-item overlay policy consulted during conflict resolution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conflict::OverlayPolicy;
use super::ids::ItemId;
use super::quickxor::QuickXor;
use super::state::{ItemState, TransferKind, TransitionOptions};
use crate::error::CoreError;

// ============================================================================
// ItemKind
// ============================================================================

/// Whether an item is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Directory,
}

// ============================================================================
// Bookkeeping records
// ============================================================================

/// Hydration bookkeeping, persisted with the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydrationInfo {
    /// Worker that performed (or is performing) the hydration.
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message of the last attempt, if it failed.
    pub error: Option<String>,
}

/// Upload bookkeeping, persisted with the entry so a chunked session
/// can resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Index of the last chunk the remote acknowledged.
    pub last_successful_chunk: Option<u32>,
    pub bytes_uploaded: u64,
    /// Resumable session URL for large uploads.
    pub upload_url: Option<String>,
    /// True when the persisted fields above describe a resumable session.
    pub can_resume: bool,
    pub checkpoint_at: Option<DateTime<Utc>>,
}

impl UploadInfo {
    /// Clears the resumable-session fields after completion or abandon.
    pub fn clear_resume(&mut self) {
        self.last_successful_chunk = None;
        self.bytes_uploaded = 0;
        self.upload_url = None;
        self.can_resume = false;
        self.checkpoint_at = None;
    }
}

/// Details of the most recent terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    /// True if a retry could plausibly succeed.
    pub temporary: bool,
    /// Which transfer the failure originated from.
    pub origin: Option<TransferKind>,
}

// ============================================================================
// FileStatus
// ============================================================================

/// User-visible synchronization status, exposed through the
/// `user.onemount.status` extended attribute and the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    /// Content only in the cloud.
    Cloud,
    /// Fully synced, content cached locally.
    Local,
    /// Local changes not yet uploaded.
    LocalModified,
    /// An upload is in flight.
    Syncing,
    /// A download is in flight.
    Downloading,
    /// Local changes cannot currently reach the remote.
    OutofSync,
    /// The last transfer failed.
    Error,
    /// A conflict awaits resolution.
    Conflict,
}

impl FileStatus {
    /// Wire form, byte-for-byte what the xattr reports.
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Cloud => "Cloud",
            FileStatus::Local => "Local",
            FileStatus::LocalModified => "LocalModified",
            FileStatus::Syncing => "Syncing",
            FileStatus::Downloading => "Downloading",
            FileStatus::OutofSync => "OutofSync",
            FileStatus::Error => "Error",
            FileStatus::Conflict => "Conflict",
        }
    }
}

/// Runtime knowledge the status derivation needs beyond the entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusContext {
    /// An upload session for this item is currently running.
    pub uploading: bool,
    /// A hydration for this item is currently running.
    pub downloading: bool,
    /// The connectivity probe currently reports offline.
    pub offline: bool,
}

// ============================================================================
// Entry
// ============================================================================

/// Metadata record of a single file or directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    id: ItemId,
    name: String,
    parent_id: ItemId,
    kind: ItemKind,
    size: u64,
    mtime: DateTime<Utc>,
    /// POSIX permission bits (no file-type bits).
    mode: u32,
    etag: Option<String>,
    quick_xor: Option<QuickXor>,
    /// Extended attributes, excluding the synthesized `user.onemount.*` ones.
    #[serde(default)]
    xattrs: HashMap<String, Vec<u8>>,
    /// Child ids, directories only.
    #[serde(default)]
    children: Vec<ItemId>,
    /// Served from memory; never hydrated, uploaded, or transitioned.
    #[serde(default)]
    virtual_item: bool,
    state: ItemState,
    /// Set by writes; cleared when an upload completes.
    #[serde(default)]
    has_changes: bool,
    last_hydrated: Option<DateTime<Utc>>,
    #[serde(default)]
    hydration: HydrationInfo,
    #[serde(default)]
    upload: UploadInfo,
    last_error: Option<ErrorDetails>,
    #[serde(default)]
    overlay_policy: OverlayPolicy,
}

impl Entry {
    /// Creates an entry for a file that exists remotely (metadata only,
    /// no local content).
    pub fn from_remote(
        id: ItemId,
        parent_id: ItemId,
        name: impl Into<String>,
        kind: ItemKind,
        size: u64,
        mtime: DateTime<Utc>,
        etag: Option<String>,
        quick_xor: Option<QuickXor>,
    ) -> Self {
        let mode = match kind {
            ItemKind::File => 0o644,
            ItemKind::Directory => 0o755,
        };
        Self {
            id,
            name: name.into(),
            parent_id,
            kind,
            size,
            mtime,
            mode,
            etag,
            quick_xor,
            xattrs: HashMap::new(),
            children: Vec::new(),
            virtual_item: false,
            state: ItemState::Ghost,
            has_changes: false,
            last_hydrated: None,
            hydration: HydrationInfo::default(),
            upload: UploadInfo::default(),
            last_error: None,
            overlay_policy: OverlayPolicy::default(),
        }
    }

    /// Creates an entry for a file created locally, before any upload.
    ///
    /// Receives a provisional id; the state starts at `DirtyLocal` so
    /// the upload pipeline picks it up.
    pub fn new_local_file(parent_id: ItemId, name: impl Into<String>, mode: u32) -> Self {
        let mut e = Self::from_remote(
            ItemId::new_local(),
            parent_id,
            name,
            ItemKind::File,
            0,
            Utc::now(),
            None,
            None,
        );
        e.mode = mode & 0o7777;
        e.state = ItemState::DirtyLocal;
        e.has_changes = true;
        e
    }

    /// Creates an entry for a directory created locally.
    pub fn new_local_directory(parent_id: ItemId, name: impl Into<String>, mode: u32) -> Self {
        let mut e = Self::from_remote(
            ItemId::new_local(),
            parent_id,
            name,
            ItemKind::Directory,
            0,
            Utc::now(),
            None,
            None,
        );
        e.mode = mode & 0o7777;
        e.state = ItemState::DirtyLocal;
        e.has_changes = true;
        e
    }

    /// Creates a virtual entry whose content is generated in memory.
    ///
    /// Virtual entries are `Hydrated` for their whole lifetime and
    /// reject every transition.
    pub fn new_virtual(parent_id: ItemId, name: impl Into<String>, size: u64) -> Self {
        let mut e = Self::from_remote(
            ItemId::new_local(),
            parent_id,
            name,
            ItemKind::File,
            size,
            Utc::now(),
            None,
            None,
        );
        e.mode = 0o444;
        e.virtual_item = true;
        e.state = ItemState::Hydrated;
        e
    }

    // --- Getters ---

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_id(&self) -> &ItemId {
        &self.parent_id
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn quick_xor(&self) -> Option<&QuickXor> {
        self.quick_xor.as_ref()
    }

    pub fn xattrs(&self) -> &HashMap<String, Vec<u8>> {
        &self.xattrs
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_item
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn has_changes(&self) -> bool {
        self.has_changes
    }

    pub fn last_hydrated(&self) -> Option<DateTime<Utc>> {
        self.last_hydrated
    }

    pub fn hydration(&self) -> &HydrationInfo {
        &self.hydration
    }

    pub fn upload(&self) -> &UploadInfo {
        &self.upload
    }

    pub fn upload_mut(&mut self) -> &mut UploadInfo {
        &mut self.upload
    }

    pub fn last_error(&self) -> Option<&ErrorDetails> {
        self.last_error.as_ref()
    }

    pub fn overlay_policy(&self) -> OverlayPolicy {
        self.overlay_policy
    }

    // --- Setters ---

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_parent_id(&mut self, parent_id: ItemId) {
        self.parent_id = parent_id;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_mtime(&mut self, mtime: DateTime<Utc>) {
        self.mtime = mtime;
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode & 0o7777;
    }

    pub fn set_etag(&mut self, etag: Option<String>) {
        self.etag = etag;
    }

    pub fn set_quick_xor(&mut self, hash: Option<QuickXor>) {
        self.quick_xor = hash;
    }

    pub fn set_xattr(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.xattrs.insert(name.into(), value);
    }

    pub fn remove_xattr(&mut self, name: &str) -> Option<Vec<u8>> {
        self.xattrs.remove(name)
    }

    pub fn set_has_changes(&mut self, v: bool) {
        self.has_changes = v;
    }

    pub fn set_overlay_policy(&mut self, policy: OverlayPolicy) {
        self.overlay_policy = policy;
    }

    /// Replaces the identifier. Only the upload success path (the
    /// local→remote exchange) and tests call this.
    pub fn set_id(&mut self, id: ItemId) {
        self.id = id;
    }

    /// Forces a state without legality checks.
    ///
    /// Crash recovery uses this to reset stale `Hydrating` items; all
    /// runtime paths go through [`Entry::apply_transition`].
    pub fn force_state(&mut self, state: ItemState) {
        self.state = state;
    }

    pub fn set_last_error(&mut self, error: Option<ErrorDetails>) {
        self.last_error = error;
    }

    // --- Children ---

    pub fn add_child(&mut self, id: ItemId) {
        if !self.children.contains(&id) {
            self.children.push(id);
        }
    }

    pub fn remove_child(&mut self, id: &ItemId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| c != id);
        self.children.len() != before
    }

    pub fn replace_child(&mut self, old: &ItemId, new: ItemId) {
        for c in self.children.iter_mut() {
            if c == old {
                *c = new;
                return;
            }
        }
    }

    // --- State machine ---

    /// Whether a transition to `target` would be accepted.
    pub fn can_transition_to(&self, target: ItemState) -> bool {
        !self.virtual_item && self.state.can_transition_to(target)
    }

    /// Applies a state transition with its bookkeeping.
    ///
    /// Illegal transitions leave the entry unchanged and return
    /// [`CoreError::InvalidTransition`]. Virtual items reject every
    /// transition.
    pub fn apply_transition(
        &mut self,
        target: ItemState,
        opts: &TransitionOptions,
    ) -> Result<(), CoreError> {
        if self.virtual_item || !self.state.can_transition_to(target) {
            return Err(CoreError::InvalidTransition {
                from: self.state.name(),
                to: target.name(),
            });
        }

        let now = Utc::now();
        let from = self.state;
        match target {
            ItemState::Hydrating => {
                let worker = opts.worker_id.as_ref().ok_or(CoreError::InvalidTransition {
                    from: from.name(),
                    to: target.name(),
                })?;
                self.hydration.worker_id = Some(worker.clone());
                self.hydration.started_at = Some(now);
                self.hydration.completed_at = None;
                self.hydration.error = None;
            }
            ItemState::Hydrated => {
                match from {
                    ItemState::Hydrating => {
                        self.hydration.completed_at = Some(now);
                        self.last_hydrated = Some(now);
                    }
                    ItemState::DirtyLocal | ItemState::Conflict => {
                        self.upload.completed_at = Some(now);
                        self.upload.clear_resume();
                        self.has_changes = false;
                    }
                    _ => {}
                }
                self.last_error = None;
            }
            ItemState::DirtyLocal => {
                self.has_changes = true;
            }
            ItemState::Error => {
                let message = opts.error.clone().unwrap_or_else(|| "unknown".to_string());
                if opts.origin == Some(TransferKind::Hydration) {
                    self.hydration.error = Some(message.clone());
                }
                self.last_error = Some(ErrorDetails {
                    message,
                    temporary: opts.error_temporary,
                    origin: opts.origin,
                });
            }
            ItemState::Ghost => {
                // Eviction or cancelled hydration: content is gone but
                // the remote metadata stays valid.
                self.last_hydrated = None;
            }
            ItemState::Conflict | ItemState::Deleted => {}
        }

        self.state = target;
        Ok(())
    }

    // --- Status derivation ---

    /// Derives the user-visible [`FileStatus`].
    pub fn status(&self, ctx: StatusContext) -> FileStatus {
        match self.state {
            ItemState::Conflict => FileStatus::Conflict,
            ItemState::Error => FileStatus::Error,
            ItemState::Hydrating => FileStatus::Downloading,
            ItemState::DirtyLocal => {
                if self.last_error.is_some() {
                    FileStatus::Error
                } else if ctx.uploading {
                    FileStatus::Syncing
                } else if ctx.offline {
                    FileStatus::OutofSync
                } else {
                    FileStatus::LocalModified
                }
            }
            ItemState::Hydrated => FileStatus::Local,
            ItemState::Ghost | ItemState::Deleted => {
                if ctx.downloading {
                    FileStatus::Downloading
                } else {
                    FileStatus::Cloud
                }
            }
        }
    }
}
