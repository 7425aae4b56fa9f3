//! Item placement state machine.
//!
//! Every item is in exactly one placement state at any instant, and the
//! observable sequence of states is a legal path through this graph:
//!
//! ```text
//!         ┌──── user access ────┐
//! GHOST ─────────────────────→ HYDRATING ──success──→ HYDRATED
//!   ↑                              │ failure                │
//!   │ eviction                     ↓                        │ local write
//!   │                            ERROR                      ↓
//!   │                              ↑ failure          DIRTY_LOCAL
//!   │                              └──── retry ────────────┤
//!   │                                                      │ upload success
//!   │ remote change while DIRTY_LOCAL                      ↓
//!   ↓                                                  HYDRATED
//! CONFLICT ──resolve──→ HYDRATED or DIRTY_LOCAL
//!
//! GHOST or HYDRATED ── user delete ──→ DELETED ── remote delete ──→ purge
//! ```
//!
//! The table itself lives here; enforcement (per-item serialization,
//! persistence within the transition, waiter wakeup) lives in the
//! filesystem engine's state manager.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// ItemState
// ============================================================================

/// Placement of an item's content between cloud and disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Metadata only; content exists only in the cloud.
    #[default]
    Ghost,
    /// A download worker is streaming content to local disk.
    Hydrating,
    /// Content is cached locally and matches the remote version.
    Hydrated,
    /// Local writes have not been uploaded yet.
    DirtyLocal,
    /// A remote change collided with a local mutation.
    Conflict,
    /// The last hydration or upload failed terminally.
    Error,
    /// Unlinked locally; awaiting remote removal and purge.
    Deleted,
}

impl ItemState {
    /// Returns true if the item's content is available on local disk.
    pub fn is_local(self) -> bool {
        matches!(self, ItemState::Hydrated | ItemState::DirtyLocal)
    }

    /// Returns true if a transfer for this item is in flight.
    pub fn is_transferring(self) -> bool {
        matches!(self, ItemState::Hydrating)
    }

    /// Returns true if the item has pending changes to upload.
    pub fn has_pending_changes(self) -> bool {
        matches!(self, ItemState::DirtyLocal)
    }

    /// Returns true if the item needs user attention.
    pub fn needs_attention(self) -> bool {
        matches!(self, ItemState::Conflict | ItemState::Error)
    }

    /// State name without payload, for logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            ItemState::Ghost => "Ghost",
            ItemState::Hydrating => "Hydrating",
            ItemState::Hydrated => "Hydrated",
            ItemState::DirtyLocal => "DirtyLocal",
            ItemState::Conflict => "Conflict",
            ItemState::Error => "Error",
            ItemState::Deleted => "Deleted",
        }
    }

    /// Whether `self → target` is a legal edge of the state graph.
    ///
    /// `Deleted` is terminal. Virtual items are handled one level up:
    /// they reject every transition regardless of this table.
    pub fn can_transition_to(self, target: ItemState) -> bool {
        use ItemState::*;
        match (self, target) {
            // Ghost: user access starts hydration; user delete.
            (Ghost, Hydrating) | (Ghost, Deleted) => true,

            // Hydrating: success, failure, or cancellation back to Ghost.
            (Hydrating, Hydrated) | (Hydrating, Error) | (Hydrating, Ghost) => true,

            // Hydrated: local write, eviction / remote-stale, user delete.
            (Hydrated, DirtyLocal) | (Hydrated, Ghost) | (Hydrated, Deleted) => true,

            // DirtyLocal: upload success, detected conflict, terminal failure.
            (DirtyLocal, Hydrated) | (DirtyLocal, Conflict) | (DirtyLocal, Error) => true,

            // Conflict: resolution leaves the winner cached or re-queued.
            (Conflict, Hydrated) | (Conflict, DirtyLocal) => true,

            // Error: retry either transfer direction, reset, or delete.
            (Error, Hydrating) | (Error, DirtyLocal) | (Error, Ghost) | (Error, Deleted) => true,

            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Transition options
// ============================================================================

/// Which transfer a bookkeeping event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Hydration,
    Upload,
}

/// Side-channel data accompanying a state transition.
///
/// Entering `Hydrating` requires a worker id; entering `Error` requires
/// the failure details and the originating transfer.
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Identifier of the worker performing a hydration.
    pub worker_id: Option<String>,
    /// Failure message when entering `Error`.
    pub error: Option<String>,
    /// Whether the failure is retriable.
    pub error_temporary: bool,
    /// Transfer the event originated from.
    pub origin: Option<TransferKind>,
}

impl TransitionOptions {
    pub fn hydration_worker(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            ..Default::default()
        }
    }

    pub fn failure(origin: TransferKind, message: impl Into<String>, temporary: bool) -> Self {
        Self {
            error: Some(message.into()),
            error_temporary: temporary,
            origin: Some(origin),
            ..Default::default()
        }
    }
}
