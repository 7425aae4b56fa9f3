//! Conflict-copy naming.

use chrono::{DateTime, Utc};

/// Derives names for conflict copies: `<stem>-conflict-<timestamp>.<ext>`.
pub struct ConflictNamer;

impl ConflictNamer {
    /// Conflict-copy name for `original` at `when`.
    ///
    /// The timestamp is second-resolution UTC, filesystem-safe.
    pub fn conflict_name(original: &str, when: DateTime<Utc>) -> String {
        let stamp = when.format("%Y%m%dT%H%M%S");
        match original.rsplit_once('.') {
            // A leading dot is a hidden file, not an extension.
            Some((stem, ext)) if !stem.is_empty() => {
                format!("{}-conflict-{}.{}", stem, stamp, ext)
            }
            _ => format!("{}-conflict-{}", original, stamp),
        }
    }

    /// First candidate that does not collide according to `exists`.
    ///
    /// Appends a counter suffix when the timestamped name is taken.
    pub fn generate_unique<F>(original: &str, when: DateTime<Utc>, exists: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let base = Self::conflict_name(original, when);
        if !exists(&base) {
            return base;
        }
        for n in 2.. {
            let candidate = match base.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, n, ext),
                _ => format!("{}-{}", base, n),
            };
            if !exists(&candidate) {
                return candidate;
            }
        }
        unreachable!()
    }
}
