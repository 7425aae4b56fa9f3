//! FUSE dispatcher.
//!
//! Implements `fuser::Filesystem`, mapping kernel operations onto the
//! metadata store, the content store, and the transfer managers. FUSE
//! callbacks are synchronous; the dispatcher holds a tokio runtime
//! handle and bridges with `block_on`, bounded by the configured
//! operation deadline.
//!
//! Observable semantics, in brief: opening a ghost file triggers
//! hydration and reads block until it settles; writes land in the
//! content store and mark the item dirty; flush and release queue the
//! upload; every mutation while offline journals instead. Errors
//! reach the kernel through the taxonomy's errno mapping.

use std::ffi::{c_int, OsStr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use onemount_cache::ContentStore;
use onemount_core::domain::ids::{validate_name, NAME_MAX};
use onemount_core::domain::{
    Entry, ItemId, ItemKind, ItemState, OfflineChangeKind, StatusContext, TransferPriority,
    TransitionOptions,
};
use onemount_core::ports::{DriveQuota, RemoteStore};
use onemount_core::CoreError;
use onemount_sync::{DownloadManager, OfflineJournal, StateManager, UploadManager};

use crate::handle::HandleTable;
use crate::inode::{InodeTable, ROOT_INO};
use crate::xattr;

/// Kernel attribute cache validity.
const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Reported filesystem block size.
const BLOCK_SIZE: u32 = 4096;

/// Quota cache validity for statfs.
const QUOTA_CACHE_TTL: Duration = Duration::from_secs(60);

/// Minimum interval between quota warnings.
const QUOTA_WARNING_INTERVAL: Duration = Duration::from_secs(300);

/// Quota fill fraction that triggers a warning.
const QUOTA_WARNING_THRESHOLD: f64 = 0.9;

/// The FUSE-facing filesystem.
pub struct OneMountFs {
    rt: Handle,
    root_id: ItemId,
    inodes: Arc<InodeTable>,
    handles: Arc<HandleTable>,
    state: Arc<StateManager>,
    content: Arc<ContentStore>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    journal: Arc<OfflineJournal>,
    remote: Arc<dyn RemoteStore>,
    attr_ttl: Duration,
    /// Bound on blocking waits (hydration, upload) inside callbacks.
    deadline: Duration,
    uid: u32,
    gid: u32,
    /// In-memory content of virtual items.
    virtual_blobs: DashMap<ItemId, Arc<Vec<u8>>>,
    quota_cache: Mutex<Option<(Instant, DriveQuota)>>,
    last_quota_warning: Mutex<Option<Instant>>,
}

impl OneMountFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rt: Handle,
        root_id: ItemId,
        state: Arc<StateManager>,
        content: Arc<ContentStore>,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        journal: Arc<OfflineJournal>,
        remote: Arc<dyn RemoteStore>,
        attr_ttl: Duration,
        deadline: Duration,
    ) -> Self {
        let inodes = InodeTable::new(root_id.clone());
        let handles = Arc::new(HandleTable::new());

        // Keep the kernel-facing indexes in step with the stores when
        // an upload exchanges a provisional id.
        {
            let inodes = Arc::clone(&inodes);
            let handles = Arc::clone(&handles);
            uploads.on_id_exchanged(move |old, new| {
                inodes.rekey(old, new);
                handles.rekey(old, new);
            });
        }

        Self {
            rt,
            root_id,
            inodes,
            handles,
            state,
            content,
            downloads,
            uploads,
            journal,
            remote,
            attr_ttl: if attr_ttl.is_zero() { DEFAULT_TTL } else { attr_ttl },
            deadline,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            virtual_blobs: DashMap::new(),
            quota_cache: Mutex::new(None),
            last_quota_warning: Mutex::new(None),
        }
    }

    /// Registers a virtual item: metadata entry plus in-memory content.
    pub fn add_virtual_file(&self, name: &str, content: Vec<u8>) -> Result<ItemId, CoreError> {
        let entry = Entry::new_virtual(self.root_id.clone(), name, content.len() as u64);
        let id = entry.id().clone();
        self.rt
            .block_on(self.state.metadata().save(&entry))
            .map_err(CoreError::from)?;
        self.virtual_blobs.insert(id.clone(), Arc::new(content));
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn errno(e: &CoreError) -> c_int {
        if let CoreError::InvalidTransition { from, to } = e {
            // Programming error; never meaningful to the kernel.
            error!(from, to, "illegal state transition reached the dispatcher");
        }
        e.errno()
    }

    fn entry_by_ino(&self, ino: u64) -> Result<Entry, c_int> {
        let id = self.inodes.get(ino).ok_or(libc::ENOENT)?;
        self.rt
            .block_on(self.state.metadata().get(&id))
            .map_err(|e| Self::errno(&CoreError::from(e)))
    }

    fn status_ctx(&self, id: &ItemId) -> StatusContext {
        StatusContext {
            uploading: self.uploads.is_pending(id),
            downloading: self.downloads.is_pending(id),
            offline: self.journal.is_offline(),
        }
    }

    fn attr_for(&self, entry: &Entry) -> FileAttr {
        let ino = self.inodes.ino_for(entry.id());
        let kind = if entry.is_directory() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let size = if entry.is_directory() { 0 } else { entry.size() };
        let mtime = system_time(entry.mtime());
        FileAttr {
            ino,
            size,
            blocks: (size + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE),
            // atime is not tracked separately from mtime.
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: entry.mode() as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn name_str<'a>(name: &'a OsStr) -> Result<&'a str, c_int> {
        name.to_str().ok_or(libc::EINVAL)
    }

    fn child_by_name(&self, parent: &ItemId, name: &str) -> Result<Option<Entry>, c_int> {
        self.rt
            .block_on(self.state.metadata().child_by_name(parent, name))
            .map_err(|e| Self::errno(&CoreError::from(e)))
    }

    /// Makes a file's content local, blocking on hydration when needed.
    fn ensure_local(&self, entry: &Entry) -> Result<(), c_int> {
        match entry.state() {
            ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Conflict => Ok(()),
            ItemState::Ghost | ItemState::Error | ItemState::Hydrating => {
                if self.journal.is_offline() {
                    debug!(id = %entry.id(), "content not available offline");
                    return Err(Self::errno(&CoreError::Offline(entry.name().to_string())));
                }
                self.rt.block_on(async {
                    self.downloads
                        .request(entry.id(), TransferPriority::High)
                        .await;
                    self.downloads
                        .wait(entry.id(), self.deadline)
                        .await
                        .map(|_| ())
                        .map_err(|e| Self::errno(&e))
                })
            }
            ItemState::Deleted => Err(libc::ENOENT),
        }
    }

    /// Marks an item dirty ahead of (or after) a write.
    fn mark_dirty(&self, id: &ItemId) -> Result<(), c_int> {
        let result = self.rt.block_on(self.state.transition(
            id,
            ItemState::DirtyLocal,
            TransitionOptions::default(),
        ));
        match result {
            Ok(_) => Ok(()),
            // Already dirty: fine.
            Err(CoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(Self::errno(&e)),
        }
    }

    /// Queues the upload for a dirtied file, or journals while offline.
    fn schedule_upload(&self, id: &ItemId, path_hint: &str) {
        if self.journal.is_offline() {
            let result = self.rt.block_on(self.journal.record(
                id,
                OfflineChangeKind::Modify,
                path_hint,
                None,
            ));
            if let Err(e) = result {
                warn!(%id, error = %e, "offline modify could not be journaled");
            }
            return;
        }
        let result = self
            .rt
            .block_on(self.uploads.queue(id, TransferPriority::Normal));
        if let Err(e) = result {
            warn!(%id, error = %e, "upload could not be queued");
        }
    }

    /// Lists a ghost directory from the remote on first access.
    fn populate_directory(&self, entry: &Entry) -> Result<(), c_int> {
        if entry.state() != ItemState::Ghost || self.journal.is_offline() {
            return Ok(());
        }
        let Some(remote_id) = entry.id().as_remote().map(String::from) else {
            return Ok(());
        };
        let id = entry.id().clone();
        self.rt
            .block_on(async {
                let _marker = self
                    .state
                    .transition(
                        &id,
                        ItemState::Hydrating,
                        TransitionOptions::hydration_worker("dirlist"),
                    )
                    .await?;

                let mut page_token: Option<String> = None;
                let mut parent = self.state.metadata().get(&id).await.map_err(CoreError::from)?;
                loop {
                    let page = self
                        .remote
                        .list_children(&remote_id, page_token.as_deref())
                        .await
                        .map_err(CoreError::from)?;
                    for child in page.items {
                        let child_id = ItemId::remote(child.id.clone());
                        if self
                            .state
                            .metadata()
                            .try_get(&child_id)
                            .await
                            .map_err(CoreError::from)?
                            .is_none()
                        {
                            let ghost = Entry::from_remote(
                                child_id.clone(),
                                id.clone(),
                                child.name.clone(),
                                if child.is_directory {
                                    ItemKind::Directory
                                } else {
                                    ItemKind::File
                                },
                                child.size.unwrap_or(0),
                                child.mtime.unwrap_or_else(chrono::Utc::now),
                                child.etag.clone(),
                                child
                                    .quick_xor
                                    .as_deref()
                                    .and_then(|h| onemount_core::domain::QuickXor::new(h).ok()),
                            );
                            self.state
                                .metadata()
                                .save(&ghost)
                                .await
                                .map_err(CoreError::from)?;
                            parent.add_child(child_id);
                        }
                    }
                    match page.next_page {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
                self.state
                    .metadata()
                    .save(&parent)
                    .await
                    .map_err(CoreError::from)?;
                self.state
                    .transition(&id, ItemState::Hydrated, TransitionOptions::default())
                    .await?;
                Ok::<(), CoreError>(())
            })
            .map_err(|e| {
                // Listing failure leaves the directory a ghost for the
                // next attempt.
                let _ = self.rt.block_on(self.state.transition(
                    &id,
                    ItemState::Ghost,
                    TransitionOptions::default(),
                ));
                Self::errno(&e)
            })
    }

    /// Removes an item everywhere: remote (or journal), stores, indexes.
    fn remove_item(&self, entry: &Entry, path_hint: &str) -> Result<(), c_int> {
        let id = entry.id().clone();
        self.uploads.cancel(&id);
        self.downloads.cancel(&id);
        self.rt
            .block_on(async {
                let _ = self.state.metadata().delete_upload(&id).await;
                // DELETED gate; Ghost/Hydrated/Error accept it.
                let _ = self
                    .state
                    .transition(&id, ItemState::Deleted, TransitionOptions::default())
                    .await;

                if self.journal.is_offline() {
                    self.journal
                        .record(&id, OfflineChangeKind::Delete, path_hint, None)
                        .await?;
                } else if let Some(remote_id) = id.as_remote() {
                    match self.remote.delete(remote_id).await {
                        Ok(()) => {}
                        Err(e) if matches!(e, onemount_core::ports::RemoteError::NotFound(_)) => {}
                        Err(e) if e.is_transient() => {
                            // Remote removal will be replayed.
                            self.journal
                                .record(&id, OfflineChangeKind::Delete, path_hint, None)
                                .await?;
                        }
                        Err(e) => return Err(CoreError::from(e)),
                    }
                }

                // Purge.
                if let Ok(mut parent) =
                    self.state.metadata().get(entry.parent_id()).await
                {
                    parent.remove_child(&id);
                    let _ = self.state.metadata().save(&parent).await;
                }
                self.state.metadata().delete(&id).await.map_err(CoreError::from)?;
                let _ = self.content.delete(&id);
                Ok::<(), CoreError>(())
            })
            .map_err(|e| Self::errno(&e))?;
        self.inodes.remove(&id);
        self.state.forget(&id);
        Ok(())
    }
}

fn system_time(t: chrono::DateTime<chrono::Utc>) -> SystemTime {
    let secs = t.timestamp();
    let nanos = t.timestamp_subsec_nanos();
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH
    }
}

fn chrono_time(t: SystemTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from(t)
}

// ============================================================================
// Filesystem trait implementation
// ============================================================================

impl Filesystem for OneMountFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("filesystem initializing");

        // Crash recovery: items stuck mid-hydration return to ghosts
        // and their partial blobs are discarded; checkpointed upload
        // sessions are re-queued.
        let result = self.rt.block_on(async {
            let entries = self.state.metadata().all_entries().await?;
            let mut reset = 0usize;
            for entry in entries {
                if entry.state() == ItemState::Hydrating {
                    let _ = self.content.discard_stale_partial(entry.id());
                    self.state
                        .metadata()
                        .update(entry.id(), |e| e.force_state(ItemState::Ghost))
                        .await?;
                    reset += 1;
                }
            }
            Ok::<usize, onemount_cache::CacheError>(reset)
        });
        match result {
            Ok(reset) if reset > 0 => {
                info!(count = reset, "reset stale hydrating items from a previous crash")
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "crash recovery failed");
                return Err(libc::EIO);
            }
        }

        match self.rt.block_on(self.uploads.restore_persisted()) {
            Ok(0) => {}
            Ok(n) => info!(count = n, "resumed persisted upload sessions"),
            Err(e) => warn!(error = %e, "could not restore persisted uploads"),
        }

        Ok(())
    }

    fn destroy(&mut self) {
        info!("filesystem shutting down");
        self.downloads.shutdown();
        self.uploads.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match Self::name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        debug!(parent, name, "lookup");
        let parent_id = match self.inodes.get(parent) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        match self.child_by_name(&parent_id, name) {
            Ok(Some(entry)) if entry.state() != ItemState::Deleted => {
                reply.entry(&self.attr_ttl, &self.attr_for(&entry), 0)
            }
            Ok(_) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.entry_by_ino(ino) {
            Ok(entry) => reply.attr(&self.attr_ttl, &self.attr_for(&entry)),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(ino, ?mode, ?size, "setattr");
        let entry = match self.entry_by_ino(ino) {
            Ok(entry) => entry,
            Err(e) => return reply.error(e),
        };
        let id = entry.id().clone();

        // Truncation touches content; the state graph has no shortcut
        // from ghost to dirty, so non-local content hydrates first.
        if let Some(new_size) = size {
            if entry.is_directory() {
                return reply.error(libc::EISDIR);
            }
            if !entry.state().is_local() && !entry.is_virtual() {
                if let Err(e) = self.ensure_local(&entry) {
                    return reply.error(e);
                }
            }
            if let Err(e) = self.content.truncate(&id, new_size) {
                return reply.error(Self::errno(&CoreError::from(e)));
            }
            if let Err(e) = self.mark_dirty(&id) {
                return reply.error(e);
            }
        }

        let update = self.rt.block_on(self.state.metadata().update(&id, |e| {
            if let Some(mode) = mode {
                e.set_mode(mode);
            }
            if let Some(new_size) = size {
                e.set_size(new_size);
            }
            match mtime {
                Some(TimeOrNow::SpecificTime(t)) => e.set_mtime(chrono_time(t)),
                Some(TimeOrNow::Now) => e.set_mtime(chrono::Utc::now()),
                None => {}
            }
            // chown is accepted and ignored.
        }));
        match update {
            Ok(updated) => {
                if size.is_some() {
                    self.schedule_upload(&id, updated.name());
                }
                reply.attr(&self.attr_ttl, &self.attr_for(&updated))
            }
            Err(e) => reply.error(Self::errno(&CoreError::from(e))),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        if rdev != 0 {
            return reply.error(libc::EPERM);
        }
        match self.create_file(parent, name, mode) {
            Ok(entry) => reply.entry(&self.attr_ttl, &self.attr_for(&entry), 0),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name_str = match Self::name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let parent_id = match self.inodes.get(parent) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        let entry = match self.child_by_name(&parent_id, name_str) {
            Ok(Some(_)) if flags & libc::O_EXCL != 0 => return reply.error(libc::EEXIST),
            Ok(Some(existing)) => existing,
            Ok(None) => match self.create_file(parent, name, mode) {
                Ok(entry) => entry,
                Err(e) => return reply.error(e),
            },
            Err(e) => return reply.error(e),
        };

        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let fh = self.handles.open_file(entry.id().clone(), writable);
        reply.created(&self.attr_ttl, &self.attr_for(&entry), 0, fh, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match Self::name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        debug!(parent, name, "mkdir");
        if let Err(e) = validate_name(name) {
            return reply.error(Self::errno(&e));
        }
        let parent_id = match self.inodes.get(parent) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        match self.child_by_name(&parent_id, name) {
            Ok(Some(_)) => return reply.error(libc::EEXIST),
            Ok(None) => {}
            Err(e) => return reply.error(e),
        }

        let entry = Entry::new_local_directory(parent_id.clone(), name, mode);
        let id = entry.id().clone();
        let result = self.rt.block_on(async {
            self.state.metadata().save(&entry).await?;
            let mut parent = self.state.metadata().get(&parent_id).await?;
            parent.add_child(id.clone());
            self.state.metadata().save(&parent).await
        });
        if let Err(e) = result {
            return reply.error(Self::errno(&CoreError::from(e)));
        }

        if self.journal.is_offline() {
            let _ = self.rt.block_on(self.journal.record(
                &id,
                OfflineChangeKind::Create,
                format!("/{}", name),
                None,
            ));
        } else {
            // Create remotely right away; failure journals for replay.
            match self.rt.block_on(self.uploads.sync_folder(&id)) {
                Ok(new_id) => {
                    let entry = self
                        .rt
                        .block_on(self.state.metadata().get(&new_id))
                        .ok();
                    if let Some(entry) = entry {
                        return reply.entry(&self.attr_ttl, &self.attr_for(&entry), 0);
                    }
                }
                Err(e) => {
                    warn!(%id, error = %e, "remote mkdir deferred");
                    let _ = self.rt.block_on(self.journal.record(
                        &id,
                        OfflineChangeKind::Create,
                        format!("/{}", name),
                        None,
                    ));
                }
            }
        }
        reply.entry(&self.attr_ttl, &self.attr_for(&entry), 0)
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        debug!(parent, name, "unlink");
        let parent_id = match self.inodes.get(parent) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        let entry = match self.child_by_name(&parent_id, name) {
            Ok(Some(entry)) => entry,
            Ok(None) => return reply.error(libc::ENOENT),
            Err(e) => return reply.error(e),
        };
        if entry.is_directory() {
            return reply.error(libc::EISDIR);
        }
        match self.remove_item(&entry, &format!("/{}", name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        debug!(parent, name, "rmdir");
        let parent_id = match self.inodes.get(parent) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        let entry = match self.child_by_name(&parent_id, name) {
            Ok(Some(entry)) => entry,
            Ok(None) => return reply.error(libc::ENOENT),
            Err(e) => return reply.error(e),
        };
        if !entry.is_directory() {
            return reply.error(libc::ENOTDIR);
        }
        let children = match self
            .rt
            .block_on(self.state.metadata().list_children(entry.id()))
        {
            Ok(children) => children,
            Err(e) => return reply.error(Self::errno(&CoreError::from(e))),
        };
        if !children.is_empty() {
            return reply.error(libc::ENOTEMPTY);
        }
        match self.remove_item(&entry, &format!("/{}", name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (Self::name_str(name), Self::name_str(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        debug!(parent, name, newparent, newname, "rename");
        if let Err(e) = validate_name(newname) {
            return reply.error(Self::errno(&e));
        }
        let (parent_id, newparent_id) = match (self.inodes.get(parent), self.inodes.get(newparent))
        {
            (Some(a), Some(b)) => (a, b),
            _ => return reply.error(libc::ENOENT),
        };
        let source = match self.child_by_name(&parent_id, name) {
            Ok(Some(entry)) => entry,
            Ok(None) => return reply.error(libc::ENOENT),
            Err(e) => return reply.error(e),
        };

        // Case-insensitive collision at the target: the existing item
        // is removed (remotely then locally) before the rename, unless
        // it is the source itself under a case change.
        match self.child_by_name(&newparent_id, newname) {
            Ok(Some(existing)) if existing.id() != source.id() => {
                if let Err(e) = self.remove_item(&existing, &format!("/{}", newname)) {
                    return reply.error(e);
                }
            }
            Ok(_) => {}
            Err(e) => return reply.error(e),
        }

        let id = source.id().clone();
        let moved_parent = parent_id != newparent_id;
        let result = self.rt.block_on(async {
            let _guard = self.state.lock(&id).await;
            self.state
                .metadata()
                .update(&id, |e| {
                    e.set_name(newname.to_string());
                    e.set_parent_id(newparent_id.clone());
                })
                .await?;
            if moved_parent {
                let mut old_parent = self.state.metadata().get(&parent_id).await?;
                old_parent.remove_child(&id);
                self.state.metadata().save(&old_parent).await?;
                let mut new_parent = self.state.metadata().get(&newparent_id).await?;
                new_parent.add_child(id.clone());
                self.state.metadata().save(&new_parent).await?;
            }
            Ok::<(), onemount_cache::CacheError>(())
        });
        if let Err(e) = result {
            return reply.error(Self::errno(&CoreError::from(e)));
        }

        // Propagate to the remote, or journal the intent.
        let old_path = format!("/{}", name);
        let new_path = format!("/{}", newname);
        if self.journal.is_offline() {
            let _ = self.rt.block_on(self.journal.record(
                &id,
                OfflineChangeKind::Rename,
                &old_path,
                Some(new_path),
            ));
        } else if id.is_local() {
            // A provisional item renames implicitly when it uploads;
            // the entry already carries the new name.
        } else if let (Some(remote_id), Some(remote_parent)) =
            (id.as_remote(), newparent_id.as_remote())
        {
            let renamed = self
                .rt
                .block_on(self.remote.rename(remote_id, newname, remote_parent));
            match renamed {
                Ok(item) => {
                    let _ = self.rt.block_on(
                        self.state
                            .metadata()
                            .update(&id, |e| e.set_etag(item.etag.clone())),
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!(%id, error = %e, "remote rename deferred");
                    let _ = self.rt.block_on(self.journal.record(
                        &id,
                        OfflineChangeKind::Rename,
                        &old_path,
                        Some(new_path),
                    ));
                }
                Err(e) => return reply.error(Self::errno(&CoreError::from(e))),
            }
        }
        reply.ok()
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let entry = match self.entry_by_ino(ino) {
            Ok(entry) => entry,
            Err(e) => return reply.error(e),
        };
        if entry.is_directory() {
            return reply.error(libc::EISDIR);
        }
        debug!(ino, id = %entry.id(), flags, "open");

        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if writable && entry.is_virtual() {
            return reply.error(libc::EACCES);
        }

        if writable && flags & libc::O_TRUNC != 0 {
            if let Err(e) = self.ensure_local(&entry) {
                return reply.error(e);
            }
            if let Err(e) = self.content.truncate(entry.id(), 0) {
                return reply.error(Self::errno(&CoreError::from(e)));
            }
            let dirty = self
                .mark_dirty(entry.id())
                .and_then(|_| {
                    self.rt
                        .block_on(self.state.metadata().update(entry.id(), |e| e.set_size(0)))
                        .map_err(|e| Self::errno(&CoreError::from(e)))
                        .map(|_| ())
                });
            if let Err(e) = dirty {
                return reply.error(e);
            }
        } else if entry.state() == ItemState::Ghost && !entry.is_virtual() {
            // Trigger hydration early; reads will block on it.
            if !self.journal.is_offline() {
                let _ = self
                    .rt
                    .block_on(self.downloads.request(entry.id(), TransferPriority::High));
            }
        }

        let fh = self.handles.open_file(entry.id().clone(), writable);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let handle = match self.handles.file(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        let id = handle.id();
        let entry = match self.rt.block_on(self.state.metadata().get(&id)) {
            Ok(entry) => entry,
            Err(e) => return reply.error(Self::errno(&CoreError::from(e))),
        };
        debug!(ino, fh, offset, size, "read");

        // Virtual items are served straight from memory.
        if entry.is_virtual() {
            let content = match self.virtual_blobs.get(&id) {
                Some(c) => Arc::clone(&c),
                None => return reply.error(libc::EIO),
            };
            let start = (offset.max(0) as usize).min(content.len());
            let end = (start + size as usize).min(content.len());
            return reply.data(&content[start..end]);
        }

        if let Err(e) = self.ensure_local(&entry) {
            return reply.error(e);
        }

        let blob = match handle.blob_or_open(|| {
            self.content.open(&id).map_err(CoreError::from)
        }) {
            Ok(blob) => blob,
            Err(e) => return reply.error(Self::errno(&e)),
        };
        let mut buf = vec![0u8; size as usize];
        match blob.read_at(&mut buf, offset.max(0) as u64) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf)
            }
            Err(e) => reply.error(Self::errno(&CoreError::from(e))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let handle = match self.handles.file(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };
        if !handle.writable {
            return reply.error(libc::EBADF);
        }
        let id = handle.id();
        let entry = match self.rt.block_on(self.state.metadata().get(&id)) {
            Ok(entry) => entry,
            Err(e) => return reply.error(Self::errno(&CoreError::from(e))),
        };
        debug!(ino, fh, offset, len = data.len(), "write");

        if entry.is_virtual() {
            return reply.error(libc::EACCES);
        }
        // Writes into not-yet-local content require hydration first;
        // a fresh local file already has its (possibly empty) blob.
        if !entry.state().is_local() {
            if let Err(e) = self.ensure_local(&entry) {
                return reply.error(e);
            }
        }

        let blob = match handle.blob_or_open(|| {
            self.content.open(&id).map_err(CoreError::from)
        }) {
            Ok(blob) => blob,
            Err(e) => return reply.error(Self::errno(&e)),
        };
        if let Err(e) = blob.write_at(data, offset.max(0) as u64) {
            return reply.error(Self::errno(&CoreError::from(e)));
        }
        if let Err(e) = self.mark_dirty(&id) {
            return reply.error(e);
        }

        let end = offset.max(0) as u64 + data.len() as u64;
        let update = self.rt.block_on(self.state.metadata().update(&id, |e| {
            if end > e.size() {
                e.set_size(end);
            }
            e.set_mtime(chrono::Utc::now());
            e.set_has_changes(true);
        }));
        if let Err(e) = update {
            return reply.error(Self::errno(&CoreError::from(e)));
        }
        handle.mark_dirty();
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!(ino, fh, "flush");
        if let Some(handle) = self.handles.file(fh) {
            if handle.clear_dirty() {
                let id = handle.id();
                // The checksum the upload snapshot relies on comes from
                // the blob on disk; sync it down first.
                if let Some(blob) = handle.take_blob() {
                    let _ = blob.sync();
                    match self.content.release(&id) {
                        Ok(Some(hash)) => {
                            let _ = self.rt.block_on(
                                self.state
                                    .metadata()
                                    .update(&id, |e| e.set_quick_xor(Some(hash.clone()))),
                            );
                        }
                        Ok(None) => {}
                        Err(e) => warn!(%id, error = %e, "blob release failed"),
                    }
                }
                let entry = self.rt.block_on(self.state.metadata().get(&id));
                let path_hint = entry.map(|e| format!("/{}", e.name())).unwrap_or_default();
                self.schedule_upload(&id, &path_hint);
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!(ino, fh, "release");
        if let Some(handle) = self.handles.close_file(fh) {
            let id = handle.id();
            let dirty = handle.clear_dirty();
            if handle.take_blob().is_some() {
                match self.content.release(&id) {
                    Ok(Some(hash)) => {
                        let _ = self.rt.block_on(
                            self.state
                                .metadata()
                                .update(&id, |e| e.set_quick_xor(Some(hash.clone()))),
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%id, error = %e, "blob release failed"),
                }
            }
            if dirty {
                let entry = self.rt.block_on(self.state.metadata().get(&id));
                let path_hint = entry.map(|e| format!("/{}", e.name())).unwrap_or_default();
                self.schedule_upload(&id, &path_hint);
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let entry = match self.entry_by_ino(ino) {
            Ok(entry) => entry,
            Err(e) => return reply.error(e),
        };
        if !entry.is_directory() {
            return reply.error(libc::ENOTDIR);
        }
        debug!(ino, id = %entry.id(), "opendir");

        if let Err(e) = self.populate_directory(&entry) {
            // An unreachable remote still serves the cached listing.
            debug!(ino, errno = e, "directory population failed, serving cache");
        }

        let children = match self
            .rt
            .block_on(self.state.metadata().list_children(entry.id()))
        {
            Ok(children) => children
                .into_iter()
                .filter(|c| c.state() != ItemState::Deleted)
                .collect(),
            Err(e) => return reply.error(Self::errno(&CoreError::from(e))),
        };
        let fh = self.handles.open_dir(entry.id().clone(), children);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!(ino, fh, offset, "readdir");
        let handle = match self.handles.dir(fh) {
            Some(h) => h,
            None => return reply.error(libc::EBADF),
        };

        // Offsets are positions in the opendir snapshot: 1 for ".",
        // 2 for "..", children from 3. They stay stable for the whole
        // open.
        let parent_ino = self
            .rt
            .block_on(self.state.metadata().get(&handle.id))
            .ok()
            .and_then(|e| self.inodes.ino_of(e.parent_id()))
            .unwrap_or(ROOT_INO);

        let mut position = offset;
        loop {
            match position {
                0 => {
                    if reply.add(ino, 1, FileType::Directory, ".") {
                        break;
                    }
                }
                1 => {
                    if reply.add(parent_ino, 2, FileType::Directory, "..") {
                        break;
                    }
                }
                n => {
                    let index = (n - 2) as usize;
                    match handle.children.get(index) {
                        Some(child) => {
                            let kind = if child.is_directory() {
                                FileType::Directory
                            } else {
                                FileType::RegularFile
                            };
                            let child_ino = self.inodes.ino_for(child.id());
                            if reply.add(child_ino, n + 1, kind, child.name()) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            position += 1;
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.handles.close_dir(fh);
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = match Self::name_str(name) {
            Ok(n) => n,
            Err(_) => return reply.error(libc::ENODATA),
        };
        let entry = match self.entry_by_ino(ino) {
            Ok(entry) => entry,
            Err(e) => return reply.error(e),
        };
        let ctx = self.status_ctx(entry.id());
        let value = if xattr::is_synthesized(name) {
            xattr::synthesized_value(&entry, ctx, name)
        } else {
            entry.xattrs().get(name).cloned()
        };
        match value {
            Some(value) => {
                if size == 0 {
                    reply.size(value.len() as u32)
                } else if (value.len() as u32) <= size {
                    reply.data(&value)
                } else {
                    reply.error(libc::ERANGE)
                }
            }
            None => reply.error(libc::ENODATA),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let entry = match self.entry_by_ino(ino) {
            Ok(entry) => entry,
            Err(e) => return reply.error(e),
        };
        let ctx = self.status_ctx(entry.id());
        let encoded = xattr::encode_list(&xattr::list_names(&entry, ctx));
        if size == 0 {
            reply.size(encoded.len() as u32)
        } else if (encoded.len() as u32) <= size {
            reply.data(&encoded)
        } else {
            reply.error(libc::ERANGE)
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match Self::name_str(name) {
            Ok(n) => n.to_string(),
            Err(e) => return reply.error(e),
        };
        // The synthesized namespace is read-only.
        if xattr::is_synthesized(&name) {
            return reply.error(libc::EACCES);
        }
        let id = match self.inodes.get(ino) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        let value = value.to_vec();
        match self
            .rt
            .block_on(self.state.metadata().update(&id, |e| e.set_xattr(name, value)))
        {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(Self::errno(&CoreError::from(e))),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::name_str(name) {
            Ok(n) => n.to_string(),
            Err(e) => return reply.error(e),
        };
        if xattr::is_synthesized(&name) {
            return reply.error(libc::EACCES);
        }
        let id = match self.inodes.get(ino) {
            Some(id) => id,
            None => return reply.error(libc::ENOENT),
        };
        let mut removed = false;
        let update = self.rt.block_on(self.state.metadata().update(&id, |e| {
            removed = e.remove_xattr(&name).is_some();
        }));
        match update {
            Ok(_) if removed => reply.ok(),
            Ok(_) => reply.error(libc::ENODATA),
            Err(e) => reply.error(Self::errno(&CoreError::from(e))),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let quota = self.cached_quota();
        let total_blocks = quota.total / u64::from(BLOCK_SIZE);
        let free_blocks = quota.total.saturating_sub(quota.used) / u64::from(BLOCK_SIZE);

        // Synthesize a file count from the cache when the backend does
        // not report one.
        let files = match quota.file_count {
            Some(n) => n,
            None => self
                .rt
                .block_on(self.state.metadata().count_entries())
                .unwrap_or(0),
        };

        if quota.total > 0 {
            let used_fraction = quota.used as f64 / quota.total as f64;
            if used_fraction >= QUOTA_WARNING_THRESHOLD {
                let mut last = self.last_quota_warning.lock().expect("quota lock");
                let due = last
                    .map(|t| t.elapsed() >= QUOTA_WARNING_INTERVAL)
                    .unwrap_or(true);
                if due {
                    warn!(
                        used = quota.used,
                        total = quota.total,
                        "remote storage almost full"
                    );
                    *last = Some(Instant::now());
                }
            }
        }

        reply.statfs(
            total_blocks,
            free_blocks,
            free_blocks,
            files,
            1 << 20,
            BLOCK_SIZE,
            NAME_MAX as u32,
            BLOCK_SIZE,
        );
    }
}

impl OneMountFs {
    /// Creates a new local file under `parent` and links it in.
    fn create_file(&self, parent: u64, name: &OsStr, mode: u32) -> Result<Entry, c_int> {
        let name = Self::name_str(name)?;
        if name.len() > NAME_MAX {
            return Err(libc::ENAMETOOLONG);
        }
        validate_name(name).map_err(|e| Self::errno(&e))?;
        let parent_id = self.inodes.get(parent).ok_or(libc::ENOENT)?;
        if self.child_by_name(&parent_id, name)?.is_some() {
            return Err(libc::EEXIST);
        }

        let entry = Entry::new_local_file(parent_id.clone(), name, mode);
        let id = entry.id().clone();
        debug!(parent, name, %id, "create");
        self.rt
            .block_on(async {
                self.state.metadata().save(&entry).await?;
                let mut parent = self.state.metadata().get(&parent_id).await?;
                parent.add_child(id.clone());
                self.state.metadata().save(&parent).await
            })
            .map_err(|e| Self::errno(&CoreError::from(e)))?;

        if self.journal.is_offline() {
            let _ = self.rt.block_on(self.journal.record(
                &id,
                OfflineChangeKind::Create,
                format!("/{}", name),
                None,
            ));
        }
        // Ensure the (empty) blob exists so a create-then-stat-then-
        // close sequence uploads zero bytes rather than failing.
        let _ = self.content.insert(&id, &[]);
        Ok(entry)
    }

    fn cached_quota(&self) -> DriveQuota {
        {
            let cache = self.quota_cache.lock().expect("quota lock");
            if let Some((at, quota)) = cache.as_ref() {
                if at.elapsed() < QUOTA_CACHE_TTL {
                    return *quota;
                }
            }
        }
        if self.journal.is_offline() {
            return self
                .quota_cache
                .lock()
                .expect("quota lock")
                .as_ref()
                .map(|(_, q)| *q)
                .unwrap_or_default();
        }
        match self.rt.block_on(self.remote.drive_quota()) {
            Ok(quota) => {
                *self.quota_cache.lock().expect("quota lock") = Some((Instant::now(), quota));
                quota
            }
            Err(e) => {
                debug!(error = %e, "quota fetch failed");
                self.quota_cache
                    .lock()
                    .expect("quota lock")
                    .as_ref()
                    .map(|(_, q)| *q)
                    .unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use onemount_cache::{DatabasePool, MetadataStore};
    use onemount_core::domain::DeltaCursor;
    use onemount_core::ports::{
        ChildPage, ChunkRange, ChunkStatus, ContentStream, DeltaPage, NullEventSink, RemoteError,
        RemoteItem, Subscription, UploadSessionInfo, UploadTarget,
    };

    /// Remote stub: every call fails as unreachable. The dispatcher
    /// paths under test never leave the local stores.
    struct StubRemote;

    #[async_trait]
    impl RemoteStore for StubRemote {
        async fn get_item(&self, id: &str) -> Result<RemoteItem, RemoteError> {
            Err(RemoteError::NotFound(id.to_string()))
        }
        async fn get_child(&self, _p: &str, n: &str) -> Result<RemoteItem, RemoteError> {
            Err(RemoteError::NotFound(n.to_string()))
        }
        async fn list_children(&self, _p: &str, _t: Option<&str>) -> Result<ChildPage, RemoteError> {
            Ok(ChildPage { items: Vec::new(), next_page: None })
        }
        async fn download_content(&self, id: &str) -> Result<ContentStream, RemoteError> {
            Err(RemoteError::NotFound(id.to_string()))
        }
        async fn put_small(&self, _t: &UploadTarget, _d: &[u8]) -> Result<RemoteItem, RemoteError> {
            Err(RemoteError::Transient("stub".into()))
        }
        async fn create_upload_session(
            &self,
            _t: &UploadTarget,
        ) -> Result<UploadSessionInfo, RemoteError> {
            Err(RemoteError::Transient("stub".into()))
        }
        async fn put_chunk(
            &self,
            _u: &str,
            _r: ChunkRange,
            _d: &[u8],
        ) -> Result<ChunkStatus, RemoteError> {
            Err(RemoteError::Transient("stub".into()))
        }
        async fn cancel_upload_session(&self, _u: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn create_folder(&self, _p: &str, _n: &str) -> Result<RemoteItem, RemoteError> {
            Err(RemoteError::Transient("stub".into()))
        }
        async fn delete(&self, _id: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn rename(
            &self,
            _id: &str,
            _n: &str,
            _p: &str,
        ) -> Result<RemoteItem, RemoteError> {
            Err(RemoteError::Transient("stub".into()))
        }
        async fn get_delta(&self, _c: Option<&DeltaCursor>) -> Result<DeltaPage, RemoteError> {
            Ok(DeltaPage {
                changes: Vec::new(),
                next_cursor: DeltaCursor::new("stub"),
            })
        }
        async fn create_subscription(
            &self,
            _r: &str,
            _n: &str,
            _c: &str,
            expiration: DateTime<Utc>,
        ) -> Result<Subscription, RemoteError> {
            Ok(Subscription { id: "stub".into(), expiration })
        }
        async fn delete_subscription(&self, _id: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn drive_quota(&self) -> Result<onemount_core::ports::DriveQuota, RemoteError> {
            Err(RemoteError::Transient("stub".into()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        rt: tokio::runtime::Runtime,
        /// Shared connectivity flag; false simulates offline mode.
        online: Arc<AtomicBool>,
        fs: OneMountFs,
    }

    fn fixture() -> Fixture {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (fs, online) = rt.block_on(async {
            let pool = DatabasePool::in_memory().await.unwrap();
            let metadata = MetadataStore::new(pool);
            let online = Arc::new(AtomicBool::new(true));
            let state = Arc::new(StateManager::new(
                metadata.clone(),
                Arc::new(NullEventSink),
                Arc::clone(&online),
            ));
            let content = Arc::new(ContentStore::new(dir.path(), u64::MAX).unwrap());
            let remote: Arc<dyn RemoteStore> = Arc::new(StubRemote);
            let downloads = DownloadManager::new(
                Arc::clone(&state),
                Arc::clone(&content),
                Arc::clone(&remote),
                Arc::new(NullEventSink),
            );
            let uploads = UploadManager::new(
                Arc::clone(&state),
                Arc::clone(&content),
                Arc::clone(&remote),
                Arc::new(NullEventSink),
                16,
                1,
            );
            let journal = Arc::new(OfflineJournal::new(metadata.clone(), Arc::clone(&online)));

            let root = Entry::from_remote(
                ItemId::remote("ROOT"),
                ItemId::sentinel(),
                "root",
                ItemKind::Directory,
                0,
                chrono::Utc::now(),
                Some("\"root\"".into()),
                None,
            );
            metadata.save(&root).await.unwrap();

            let fs = OneMountFs::new(
                tokio::runtime::Handle::current(),
                ItemId::remote("ROOT"),
                state,
                content,
                downloads,
                uploads,
                journal,
                remote,
                Duration::from_secs(1),
                Duration::from_secs(5),
            );
            (fs, online)
        });
        Fixture {
            _dir: dir,
            rt,
            online,
            fs,
        }
    }

    #[test]
    fn create_file_links_child_and_seeds_empty_blob() {
        let fx = fixture();
        let entry = fx
            .fs
            .create_file(ROOT_INO, OsStr::new("new.txt"), 0o644)
            .unwrap();
        assert_eq!(entry.state(), ItemState::DirtyLocal);
        assert!(entry.id().is_local());
        assert_eq!(entry.mode(), 0o644);

        let (root, blob) = fx.rt.block_on(async {
            let root = fx.fs.state.metadata().get(&ItemId::remote("ROOT")).await.unwrap();
            let blob = fx.fs.content.get(entry.id()).unwrap();
            (root, blob)
        });
        assert!(root.children().contains(entry.id()));
        assert_eq!(blob.unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn create_rejects_sentinel_names_and_collisions() {
        let fx = fixture();
        assert_eq!(
            fx.fs.create_file(ROOT_INO, OsStr::new("."), 0o644).unwrap_err(),
            libc::EINVAL
        );
        assert_eq!(
            fx.fs.create_file(ROOT_INO, OsStr::new("a/b"), 0o644).unwrap_err(),
            libc::EINVAL
        );

        fx.fs.create_file(ROOT_INO, OsStr::new("Dup.txt"), 0o644).unwrap();
        // Case-insensitive collision.
        assert_eq!(
            fx.fs.create_file(ROOT_INO, OsStr::new("dup.TXT"), 0o644).unwrap_err(),
            libc::EEXIST
        );
    }

    #[test]
    fn ghost_content_is_unavailable_offline() {
        let fx = fixture();
        let ghost = Entry::from_remote(
            ItemId::remote("G1"),
            ItemId::remote("ROOT"),
            "g.bin",
            ItemKind::File,
            10,
            chrono::Utc::now(),
            Some("\"e\"".into()),
            None,
        );
        fx.rt
            .block_on(fx.fs.state.metadata().save(&ghost))
            .unwrap();

        // Go offline.
        fx.online.store(false, Ordering::Release);
        let err = fx.fs.ensure_local(&ghost).unwrap_err();
        assert_eq!(err, libc::EIO);
    }

    #[test]
    fn attr_reflects_entry() {
        let fx = fixture();
        let entry = fx
            .fs
            .create_file(ROOT_INO, OsStr::new("sized.bin"), 0o600)
            .unwrap();
        let attr = fx.fs.attr_for(&entry);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.size, 0);
        assert!(attr.ino > ROOT_INO);
        // Stable node id on repeated mapping.
        assert_eq!(fx.fs.attr_for(&entry).ino, attr.ino);
    }

    #[test]
    fn virtual_files_serve_from_memory() {
        let fx = fixture();
        let id = fx
            .fs
            .add_virtual_file(".onemount-status", b"state: ok\n".to_vec())
            .unwrap();
        let entry = fx.rt.block_on(fx.fs.state.metadata().get(&id)).unwrap();
        assert!(entry.is_virtual());
        assert_eq!(entry.state(), ItemState::Hydrated);
        assert_eq!(entry.size(), 10);
        // Virtual items reject transitions outright.
        assert!(!entry.can_transition_to(ItemState::Ghost));
        assert!(fx.fs.virtual_blobs.get(&id).is_some());
    }
}
