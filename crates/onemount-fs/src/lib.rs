//! FUSE layer for onemount.
//!
//! [`OneMountFs`] implements `fuser::Filesystem` over the metadata and
//! content stores and the transfer managers from `onemount-sync`. The
//! [`inode::InodeTable`] maps kernel node ids to item ids (root is
//! node 1, ids are monotonic and never reused), [`handle::HandleTable`]
//! tracks open files and directory snapshots, and [`xattr`] synthesizes
//! the `user.onemount.*` status attributes.

pub mod dispatcher;
pub mod handle;
pub mod inode;
pub mod xattr;

pub use dispatcher::OneMountFs;
pub use handle::HandleTable;
pub use inode::{InodeTable, ROOT_INO};
