//! Conflict detection and resolution.
//!
//! The [`detector`] classifies a local/remote collision into a
//! [`ConflictKind`](onemount_core::domain::ConflictKind); the
//! [`resolver`] turns a [`ConflictInfo`](onemount_core::domain::ConflictInfo)
//! and a policy into a [`ResolutionOutcome`]: a transactional batch of
//! metadata operations plus the follow-up transfers (upload of the
//! surviving local content, hydration of re-introduced remote content)
//! for the caller to schedule. Keeping the resolver free of I/O makes
//! every policy branch unit-testable.

pub mod detector;
pub mod namer;
pub mod resolver;

pub use detector::classify;
pub use namer::ConflictNamer;
pub use resolver::{ConflictResolver, ResolutionOutcome};
