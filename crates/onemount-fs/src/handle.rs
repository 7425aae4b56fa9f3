//! Open-handle table.
//!
//! File handles pair an item id with a lazily opened blob descriptor;
//! the descriptor is only acquired once the item's content is local,
//! so a handle on a ghost file never pins a stale blob. Directory
//! handles carry the child snapshot taken at opendir, keeping readdir
//! offsets stable for the whole open.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use onemount_cache::BlobHandle;
use onemount_core::domain::{Entry, ItemId};

/// One open file.
pub struct FileHandle {
    id: Mutex<ItemId>,
    /// Blob descriptor, opened on first post-hydration access.
    blob: Mutex<Option<Arc<BlobHandle>>>,
    /// Opened with write intent.
    pub writable: bool,
    /// A write went through this handle since the last flush.
    dirtied: AtomicBool,
}

impl FileHandle {
    /// Current item id (tracks the provisional→remote exchange).
    pub fn id(&self) -> ItemId {
        self.id.lock().expect("handle lock").clone()
    }

    /// The cached blob descriptor, or acquires one via `open`.
    pub fn blob_or_open<F>(&self, open: F) -> Result<Arc<BlobHandle>, onemount_core::CoreError>
    where
        F: FnOnce() -> Result<Arc<BlobHandle>, onemount_core::CoreError>,
    {
        let mut blob = self.blob.lock().expect("handle lock");
        if let Some(existing) = blob.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let opened = open()?;
        *blob = Some(Arc::clone(&opened));
        Ok(opened)
    }

    /// Takes the descriptor for release, leaving the handle empty.
    pub fn take_blob(&self) -> Option<Arc<BlobHandle>> {
        self.blob.lock().expect("handle lock").take()
    }

    pub fn has_blob(&self) -> bool {
        self.blob.lock().expect("handle lock").is_some()
    }

    pub fn mark_dirty(&self) {
        self.dirtied.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) -> bool {
        self.dirtied.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtied.load(Ordering::Acquire)
    }
}

/// One open directory: the snapshot readdir serves from.
pub struct DirHandle {
    pub id: ItemId,
    /// Children at opendir time, in listing order.
    pub children: Vec<Entry>,
}

/// Allocates and tracks open handles.
pub struct HandleTable {
    files: DashMap<u64, Arc<FileHandle>>,
    dirs: DashMap<u64, Arc<DirHandle>>,
    next: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            dirs: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn open_file(&self, id: ItemId, writable: bool) -> u64 {
        let fh = self.alloc();
        self.files.insert(
            fh,
            Arc::new(FileHandle {
                id: Mutex::new(id),
                blob: Mutex::new(None),
                writable,
                dirtied: AtomicBool::new(false),
            }),
        );
        fh
    }

    pub fn open_dir(&self, id: ItemId, children: Vec<Entry>) -> u64 {
        let fh = self.alloc();
        self.dirs.insert(fh, Arc::new(DirHandle { id, children }));
        fh
    }

    pub fn file(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.files.get(&fh).map(|h| Arc::clone(&h))
    }

    pub fn dir(&self, fh: u64) -> Option<Arc<DirHandle>> {
        self.dirs.get(&fh).map(|h| Arc::clone(&h))
    }

    pub fn close_file(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.files.remove(&fh).map(|(_, h)| h)
    }

    pub fn close_dir(&self, fh: u64) -> Option<Arc<DirHandle>> {
        self.dirs.remove(&fh).map(|(_, h)| h)
    }

    /// Open file handles referencing `id`.
    pub fn open_count(&self, id: &ItemId) -> usize {
        self.files.iter().filter(|h| h.id() == *id).count()
    }

    /// Rewrites open handles after a provisional→remote id exchange.
    pub fn rekey(&self, old: &ItemId, new: &ItemId) {
        for handle in self.files.iter() {
            let mut id = handle.id.lock().expect("handle lock");
            if &*id == old {
                *id = new.clone();
            }
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
