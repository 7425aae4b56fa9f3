//! Content store: per-item blob files and the descriptor pool.
//!
//! Blobs live under `{cache_dir}/content/{aa}/{rest}` where `aa`/`rest`
//! split the SHA-256 of the item id, keeping directories shallow and
//! names path-safe regardless of what the remote puts in its ids.
//!
//! Reads and writes go through positioned I/O (`read_at`/`write_at`),
//! so a blob's seek position is never shared state between callers.
//! Open descriptors are reference-counted per item id; the QuickXOR of
//! a blob is recomputed when the last writable reference is released
//! and handed back to the caller to store on the entry.
//!
//! In-flight downloads write to a `.partial` sibling and promote it on
//! completion, so a cancelled hydration never leaves a corrupt blob.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use onemount_core::domain::{ItemId, QuickXor, QuickXorHash};

use crate::CacheError;

/// Upper bound for [`ContentStore::get`] whole-blob reads.
const SMALL_BLOB_LIMIT: u64 = 16 * 1024 * 1024;

/// Hash read chunk size.
const HASH_CHUNK: usize = 256 * 1024;

// ============================================================================
// BlobHandle
// ============================================================================

/// A reference-counted, positioned-I/O handle to one blob.
pub struct BlobHandle {
    id: ItemId,
    file: File,
    refs: AtomicUsize,
    written: AtomicBool,
}

impl BlobHandle {
    /// Reads up to `buf.len()` bytes at `offset`; returns bytes read.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Writes all of `data` at `offset`. Does not move any seek position.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<(), CacheError> {
        self.file.write_all_at(data, offset)?;
        self.written.store(true, Ordering::Release);
        Ok(())
    }

    /// Truncates or extends the blob.
    pub fn set_len(&self, len: u64) -> Result<(), CacheError> {
        self.file.set_len(len)?;
        self.written.store(true, Ordering::Release);
        Ok(())
    }

    /// Current blob length.
    pub fn len(&self) -> Result<u64, CacheError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Flushes file data to disk.
    pub fn sync(&self) -> Result<(), CacheError> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    /// Whether any write went through this handle.
    pub fn was_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }
}

// ============================================================================
// PartialBlob
// ============================================================================

/// An in-progress download target.
///
/// Appended to sequentially by a hydration worker; either committed
/// (atomically renamed over the blob path) or discarded.
pub struct PartialBlob {
    id: ItemId,
    path: PathBuf,
    file: File,
    hasher: QuickXorHash,
    len: u64,
}

impl PartialBlob {
    /// Appends a downloaded chunk, folding it into the running hash.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        self.file.write_all(chunk)?;
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// QuickXOR of everything appended so far, without consuming.
    pub fn hash(&self) -> QuickXor {
        QuickXor::new(self.hasher.clone().finalize_base64())
            .expect("hasher output is always a valid digest")
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }
}

// ============================================================================
// ContentStore
// ============================================================================

/// Size-capped blob store keyed by item id.
pub struct ContentStore {
    content_dir: PathBuf,
    max_bytes: u64,
    handles: DashMap<ItemId, Arc<BlobHandle>>,
    /// Unix-millis of last access, the LRU clock for eviction.
    last_access: DashMap<ItemId, u64>,
}

impl ContentStore {
    /// Opens (creating if needed) the content directory.
    pub fn new(cache_dir: &Path, max_bytes: u64) -> Result<Self, CacheError> {
        let content_dir = cache_dir.join("content");
        fs::create_dir_all(&content_dir)?;
        Ok(Self {
            content_dir,
            max_bytes,
            handles: DashMap::new(),
            last_access: DashMap::new(),
        })
    }

    /// Blob path for an id: `content/{aa}/{rest-of-sha256}`.
    pub fn blob_path(&self, id: &ItemId) -> PathBuf {
        let hash = Self::hash_id(id);
        let (prefix, rest) = hash.split_at(2);
        self.content_dir.join(prefix).join(rest)
    }

    fn partial_path(&self, id: &ItemId) -> PathBuf {
        let mut path = self.blob_path(id);
        let name = path.file_name().expect("blob path has a file name");
        let name = format!("{}.partial", name.to_string_lossy());
        path.set_file_name(name);
        path
    }

    fn hash_id(id: &ItemId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn touch(&self, id: &ItemId) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_access.insert(id.clone(), now);
    }

    // ------------------------------------------------------------------
    // Descriptor pool
    // ------------------------------------------------------------------

    /// Opens a blob handle, creating the blob lazily.
    ///
    /// Idempotent across callers: concurrent opens share one handle,
    /// reference-counted until every opener has released it.
    pub fn open(&self, id: &ItemId) -> Result<Arc<BlobHandle>, CacheError> {
        self.touch(id);
        if let Some(existing) = self.handles.get(id) {
            existing.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(Arc::clone(&existing));
        }

        let path = self.blob_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let handle = Arc::new(BlobHandle {
            id: id.clone(),
            file,
            refs: AtomicUsize::new(1),
            written: AtomicBool::new(false),
        });
        // A racing open may have inserted first; defer to it.
        match self.handles.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                existing.get().refs.fetch_add(1, Ordering::AcqRel);
                Ok(Arc::clone(existing.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Releases one reference to a blob handle.
    ///
    /// When the last reference goes and the handle saw writes, the
    /// blob's QuickXOR is recomputed and returned for the caller to
    /// store on the entry.
    pub fn release(&self, id: &ItemId) -> Result<Option<QuickXor>, CacheError> {
        let handle = match self.handles.get(id) {
            Some(h) => Arc::clone(&h),
            None => return Ok(None),
        };
        let previous = handle.refs.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            return Ok(None);
        }
        self.handles.remove(id);
        if !handle.was_written() {
            return Ok(None);
        }
        handle.sync()?;
        Ok(Some(self.compute_hash(id)?))
    }

    /// Recomputes the QuickXOR of a stored blob.
    pub fn compute_hash(&self, id: &ItemId) -> Result<QuickXor, CacheError> {
        let file = File::open(self.blob_path(id))?;
        let mut hasher = QuickXorHash::new();
        let mut offset = 0u64;
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read_at(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(QuickXor::new(hasher.finalize_base64())
            .expect("hasher output is always a valid digest"))
    }

    // ------------------------------------------------------------------
    // Whole-blob operations
    // ------------------------------------------------------------------

    /// Whether a blob exists for this id.
    pub fn has(&self, id: &ItemId) -> bool {
        self.handles.contains_key(id) || self.blob_path(id).exists()
    }

    /// Reads a whole small blob; `None` if absent, an error if the
    /// blob exceeds the small-read bound.
    pub fn get(&self, id: &ItemId) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.blob_path(id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len > SMALL_BLOB_LIMIT {
            return Err(CacheError::QueryFailed(format!(
                "blob {} too large for bounded read ({} bytes)",
                id, len
            )));
        }
        self.touch(id);
        let mut buf = vec![0u8; len as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read_at(&mut buf[read..], read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(Some(buf))
    }

    /// Reads a whole blob without the small-read bound.
    ///
    /// Upload snapshots use this; dirty blobs are pinned in the cache
    /// (never evicted), so the read cannot race an eviction.
    pub fn read_all(&self, id: &ItemId) -> Result<Vec<u8>, CacheError> {
        let path = self.blob_path(id);
        self.touch(id);
        Ok(fs::read(path)?)
    }

    /// Writes a whole blob.
    pub fn insert(&self, id: &ItemId, data: &[u8]) -> Result<(), CacheError> {
        let path = self.blob_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        self.touch(id);
        Ok(())
    }

    /// Removes a blob (and any partial sibling).
    pub fn delete(&self, id: &ItemId) -> Result<(), CacheError> {
        self.handles.remove(id);
        self.last_access.remove(id);
        let path = self.blob_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let partial = self.partial_path(id);
        if partial.exists() {
            let _ = fs::remove_file(&partial);
        }
        Ok(())
    }

    /// Truncates (or extends) a blob to `size`.
    pub fn truncate(&self, id: &ItemId, size: u64) -> Result<(), CacheError> {
        if let Some(handle) = self.handles.get(id) {
            return handle.set_len(size);
        }
        let path = self.blob_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(size)?;
        self.touch(id);
        Ok(())
    }

    /// Length of a stored blob, `None` if absent.
    pub fn blob_len(&self, id: &ItemId) -> Result<Option<u64>, CacheError> {
        match fs::metadata(self.blob_path(id)) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Renames the blob key. Used by the provisional→remote id exchange.
    pub fn rekey(&self, old: &ItemId, new: &ItemId) -> Result<(), CacheError> {
        let old_path = self.blob_path(old);
        if !old_path.exists() {
            return Ok(());
        }
        let new_path = self.blob_path(new);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(old_path, new_path)?;
        if let Some((_, stamp)) = self.last_access.remove(old) {
            self.last_access.insert(new.clone(), stamp);
        }
        self.handles.remove(old);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Partial downloads
    // ------------------------------------------------------------------

    /// Starts (or restarts) a partial download target for `id`.
    pub fn begin_partial(&self, id: &ItemId) -> Result<PartialBlob, CacheError> {
        let path = self.partial_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(PartialBlob {
            id: id.clone(),
            path,
            file,
            hasher: QuickXorHash::new(),
            len: 0,
        })
    }

    /// Promotes a completed partial to the blob path.
    ///
    /// Any pooled descriptor for the id is dropped: it refers to the
    /// file the rename just replaced.
    pub fn commit_partial(&self, partial: PartialBlob) -> Result<(), CacheError> {
        partial.file.sync_data()?;
        fs::rename(&partial.path, self.blob_path(&partial.id))?;
        self.handles.remove(&partial.id);
        self.touch(&partial.id);
        Ok(())
    }

    /// Discards a partial without touching any existing blob.
    pub fn discard_partial(&self, partial: PartialBlob) -> Result<(), CacheError> {
        drop(partial.file);
        if partial.path.exists() {
            fs::remove_file(&partial.path)?;
        }
        Ok(())
    }

    /// Removes any stale `.partial` files, e.g. after a crash.
    pub fn discard_stale_partial(&self, id: &ItemId) -> Result<(), CacheError> {
        let partial = self.partial_path(id);
        if partial.exists() {
            fs::remove_file(&partial)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Aggregate size of all stored blobs.
    pub fn usage(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        for shard in fs::read_dir(&self.content_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(shard.path())? {
                let file = file?;
                if file.file_type()?.is_file() {
                    total += file.metadata()?.len();
                }
            }
        }
        Ok(total)
    }

    /// Evicts least-recently-used blobs until usage fits the cap.
    ///
    /// Only ids accepted by `is_evictable` (the caller checks the item
    /// is `Hydrated`, never `DirtyLocal` or `Hydrating`) and not
    /// currently open are considered. Returns the evicted ids so the
    /// caller can transition them to ghosts.
    pub fn evict_lru<F>(&self, is_evictable: F) -> Result<Vec<ItemId>, CacheError>
    where
        F: Fn(&ItemId) -> bool,
    {
        let mut usage = self.usage()?;
        if usage <= self.max_bytes {
            return Ok(Vec::new());
        }

        // Oldest first.
        let mut candidates: Vec<(ItemId, u64)> = self
            .last_access
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        candidates.sort_by_key(|(_, stamp)| *stamp);

        let mut evicted = Vec::new();
        for (id, _) in candidates {
            if usage <= self.max_bytes {
                break;
            }
            if self.handles.contains_key(&id) || !is_evictable(&id) {
                continue;
            }
            if let Some(len) = self.blob_len(&id)? {
                self.delete(&id)?;
                usage = usage.saturating_sub(len);
                evicted.push(id);
            }
        }
        Ok(evicted)
    }
}
