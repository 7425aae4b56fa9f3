//! Transfer managers and reconciliation for onemount.
//!
//! - [`state::StateManager`] serializes per-item state transitions and
//!   wakes waiters.
//! - [`download::DownloadManager`] hydrates ghost items through a
//!   bounded, priority-ordered worker pool with at-most-one in-flight
//!   hydration per item.
//! - [`upload::UploadManager`] pushes local mutations back to the
//!   remote: snapshot sessions, small/large strategies, resumable
//!   chunked uploads persisted across restarts, post-upload
//!   verification, and the provisional→remote id exchange.
//! - [`delta::DeltaEngine`] reconciles remote changes into local
//!   metadata and detects conflicts.
//! - [`offline`] carries the connectivity monitor and the offline
//!   change journal; [`manager::SyncManager`] replays the journal on
//!   reconnect.
//! - [`backoff`] is the single exponential-backoff policy every retry
//!   site shares.

pub mod backoff;
#[cfg(test)]
pub(crate) mod testing;

pub mod delta;
pub mod download;
pub mod manager;
pub mod offline;
pub mod state;
pub mod upload;

pub use backoff::BackoffPolicy;
pub use delta::{DeltaEngine, DeltaReport};
pub use download::DownloadManager;
pub use manager::{SyncManager, SyncReport};
pub use offline::{ConnectivityMonitor, OfflineJournal};
pub use state::StateManager;
pub use upload::UploadManager;

use thiserror::Error;

/// Errors from the synchronization layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] onemount_core::CoreError),

    #[error("remote: {0}")]
    Remote(#[from] onemount_core::ports::RemoteError),

    #[error("cache: {0}")]
    Cache(#[from] onemount_cache::CacheError),
}

impl From<SyncError> for onemount_core::CoreError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Core(c) => c,
            SyncError::Remote(r) => r.into(),
            SyncError::Cache(c) => c.into(),
        }
    }
}
