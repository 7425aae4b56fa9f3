//! Offline change journal records.
//!
//! While the connectivity probe reports offline, every mutating
//! operation succeeds locally and appends one of these records to the
//! journal bucket. The sync manager replays them in sequence order on
//! reconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// The mutation a journal record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// One journaled mutation.
///
/// `seq` is assigned by the journal at append time and defines replay
/// order. Paths are recorded for reporting; replay itself operates on
/// the item id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineChange {
    /// Journal sequence number; 0 until persisted.
    #[serde(default)]
    pub seq: i64,
    pub id: ItemId,
    pub kind: OfflineChangeKind,
    /// Path at the time of the mutation.
    pub path: String,
    /// Destination path for renames.
    pub new_path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OfflineChange {
    pub fn new(id: ItemId, kind: OfflineChangeKind, path: impl Into<String>) -> Self {
        Self {
            seq: 0,
            id,
            kind,
            path: path.into(),
            new_path: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rename(id: ItemId, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            seq: 0,
            id,
            kind: OfflineChangeKind::Rename,
            path: from.into(),
            new_path: Some(to.into()),
            timestamp: Utc::now(),
        }
    }
}
