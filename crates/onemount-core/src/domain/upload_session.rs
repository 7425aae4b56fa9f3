//! Upload session snapshots.
//!
//! Queueing an upload snapshots the entry at that instant; later
//! writes produce further sessions rather than mutating a queued one.
//! The persisted portion (everything except the content bytes, which
//! are re-read from the content store on restart) lives in the
//! `uploads` bucket so chunked sessions survive a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ItemId;
use super::item::Entry;
use super::quickxor::QuickXor;

/// Small/large strategy boundary: uploads of `size >= 4 MiB` go
/// through a resumable session.
pub const LARGE_UPLOAD_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Chunk size for resumable sessions: 10 MiB, a multiple of the
/// 320 KiB granularity the remote requires.
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Queue priority for uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Immutable snapshot of a file taken at queue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Item id at snapshot time; provisional for first uploads.
    pub id: ItemId,
    pub parent_id: ItemId,
    pub name: String,
    pub size: u64,
    /// QuickXOR of the snapshot content.
    pub quick_xor: QuickXor,
    pub mtime: DateTime<Utc>,
    pub priority: TransferPriority,

    // --- Resumable progress, persisted after every checkpoint ---
    /// Destination URL for large uploads.
    pub upload_url: Option<String>,
    pub url_expiration: Option<DateTime<Utc>>,
    /// Index of the last chunk the remote acknowledged.
    pub last_successful_chunk: Option<u32>,
    pub bytes_uploaded: u64,
    pub retry_count: u32,
    /// True when the fields above describe a session that can resume.
    pub can_resume: bool,
    pub checkpoint_at: Option<DateTime<Utc>>,

    /// Snapshot content. Not persisted: on restart it is re-read from
    /// the content store and re-verified against `quick_xor`.
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl UploadSession {
    /// Snapshots `entry` with the given content bytes.
    pub fn snapshot(entry: &Entry, data: Vec<u8>, priority: TransferPriority) -> Self {
        Self {
            id: entry.id().clone(),
            parent_id: entry.parent_id().clone(),
            name: entry.name().to_string(),
            size: data.len() as u64,
            quick_xor: QuickXor::of(&data),
            mtime: entry.mtime(),
            priority,
            upload_url: None,
            url_expiration: None,
            last_successful_chunk: None,
            bytes_uploaded: 0,
            retry_count: 0,
            can_resume: false,
            checkpoint_at: None,
            data,
        }
    }

    /// Whether this session takes the resumable large-upload path.
    pub fn is_large(&self) -> bool {
        self.size >= LARGE_UPLOAD_THRESHOLD
    }

    /// Total number of chunks for the large path.
    pub fn chunk_count(&self) -> u32 {
        if self.size == 0 {
            0
        } else {
            ((self.size + UPLOAD_CHUNK_SIZE - 1) / UPLOAD_CHUNK_SIZE) as u32
        }
    }

    /// Byte offset at which a resumed session continues.
    pub fn resume_offset(&self) -> u64 {
        match self.last_successful_chunk {
            Some(n) => (n as u64 + 1) * UPLOAD_CHUNK_SIZE,
            None => 0,
        }
    }

    /// Records a successfully transferred chunk.
    pub fn record_chunk(&mut self, index: u32, chunk_len: u64) {
        self.last_successful_chunk = Some(index);
        self.bytes_uploaded = self.bytes_uploaded.saturating_add(chunk_len);
        self.can_resume = self.upload_url.is_some();
        self.checkpoint_at = Some(Utc::now());
    }
}
