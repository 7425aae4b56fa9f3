//! Local persistence for onemount.
//!
//! Two stores share the cache directory:
//!
//! - [`MetadataStore`]: the authoritative map from item id to
//!   [`Entry`](onemount_core::Entry), backed by a single embedded
//!   SQLite database with one table per bucket (`metadata`, `uploads`,
//!   `offline_changes`, `deltas`). Writes are atomic per key; batches
//!   are transactional.
//! - [`ContentStore`]: per-item blob files under `content/` with a
//!   reference-counted descriptor pool and size-capped LRU eviction.

pub mod content;
pub mod metadata;
pub mod pool;

pub use content::{BlobHandle, ContentStore, PartialBlob};
pub use metadata::{BatchOp, MetadataStore};
pub use pool::DatabasePool;

use thiserror::Error;

/// Errors from the local stores.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("blob io error: {0}")]
    BlobIo(#[from] std::io::Error),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CacheError::NotFound("row not found".to_string()),
            other => CacheError::QueryFailed(other.to_string()),
        }
    }
}

impl From<CacheError> for onemount_core::CoreError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::NotFound(m) => onemount_core::CoreError::NotFound(m),
            CacheError::BlobIo(io) => io.into(),
            other => onemount_core::CoreError::Storage(other.to_string()),
        }
    }
}
