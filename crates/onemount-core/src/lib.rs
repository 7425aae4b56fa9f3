//! Core domain logic for onemount.
//!
//! This crate holds everything the rest of the workspace agrees on:
//! the [`domain`] model (items, states, identifiers, hashes), the
//! [`error`] taxonomy with its errno mapping, the typed [`config`],
//! and the [`ports`] that decouple the filesystem engine from the
//! Graph adapter, token acquisition, and status broadcasting.
//!
//! Nothing in this crate performs I/O; adapters live in the sibling
//! crates (`onemount-cache`, `onemount-graph`, `onemount-fs`).

pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

pub use domain::ids::{DeltaCursor, ItemId};
pub use domain::item::{Entry, FileStatus, ItemKind};
pub use domain::state::ItemState;
pub use error::CoreError;
