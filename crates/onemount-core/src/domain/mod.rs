//! Domain model for onemount.
//!
//! The entities here are persistence- and transport-agnostic. They are
//! serialized into the metadata store by `onemount-cache` and projected
//! into kernel-facing attributes by `onemount-fs`, but carry no
//! knowledge of either.

pub mod conflict;
pub mod ids;
pub mod item;
pub mod offline;
pub mod quickxor;
pub mod state;
pub mod upload_session;

pub use conflict::{ConflictInfo, ConflictKind, ConflictPolicy, OverlayPolicy};
pub use ids::{DeltaCursor, ItemId};
pub use item::{Entry, FileStatus, ItemKind, StatusContext};
pub use offline::{OfflineChange, OfflineChangeKind};
pub use quickxor::{QuickXor, QuickXorHash};
pub use state::{ItemState, TransferKind, TransitionOptions};
pub use upload_session::{TransferPriority, UploadSession};
