//! Conflict records and resolution policies.
//!
//! A conflict pairs the local snapshot of an item with the remote
//! version that collided with it, plus the offline change that
//! triggered the collision when there was one. Resolution policy is a
//! closed set; when no explicit policy is configured, the item's
//! per-item overlay policy decides.

use serde::{Deserialize, Serialize};

use super::item::Entry;
use super::offline::OfflineChange;
use crate::ports::remote_store::RemoteItem;

/// What kind of collision was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the content.
    Content,
    /// Both sides changed metadata (name, parent, attributes).
    Metadata,
    /// One side deleted while the other modified.
    DeleteVsModify,
}

/// Per-item preference consulted when no explicit strategy applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPolicy {
    #[default]
    LocalWins,
    RemoteWins,
}

/// Configured resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the local file under its name; re-introduce the remote
    /// under a derived conflict-copy name.
    KeepBoth,
    /// The snapshot with the newer mtime wins; the loser is discarded.
    LastWriterWins,
    /// The local snapshot always wins.
    LocalWins,
    /// The remote snapshot always wins.
    RemoteWins,
}

impl ConflictPolicy {
    /// Parses the configuration wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keep_both" => Some(ConflictPolicy::KeepBoth),
            "last_writer_wins" => Some(ConflictPolicy::LastWriterWins),
            "local_wins" => Some(ConflictPolicy::LocalWins),
            "remote_wins" => Some(ConflictPolicy::RemoteWins),
            _ => None,
        }
    }

    /// Policy derived from an item's overlay preference.
    pub fn from_overlay(policy: OverlayPolicy) -> Self {
        match policy {
            OverlayPolicy::LocalWins => ConflictPolicy::LocalWins,
            OverlayPolicy::RemoteWins => ConflictPolicy::RemoteWins,
        }
    }
}

/// A detected conflict, handed to the resolver.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    /// Local snapshot at detection time.
    pub local: Entry,
    /// Remote version that collided with it.
    pub remote: RemoteItem,
    /// The journaled change that triggered detection, when replaying.
    pub change: Option<OfflineChange>,
    pub kind: ConflictKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!(ConflictPolicy::parse("keep_both"), Some(ConflictPolicy::KeepBoth));
        assert_eq!(
            ConflictPolicy::parse("last_writer_wins"),
            Some(ConflictPolicy::LastWriterWins)
        );
        assert_eq!(ConflictPolicy::parse("nonsense"), None);
    }

    #[test]
    fn test_policy_from_overlay() {
        assert_eq!(
            ConflictPolicy::from_overlay(OverlayPolicy::LocalWins),
            ConflictPolicy::LocalWins
        );
        assert_eq!(
            ConflictPolicy::from_overlay(OverlayPolicy::RemoteWins),
            ConflictPolicy::RemoteWins
        );
    }

    #[test]
    fn test_overlay_default_prefers_local() {
        assert_eq!(OverlayPolicy::default(), OverlayPolicy::LocalWins);
    }
}
