//! Item identifiers and name validation.
//!
//! OneDrive hands out opaque string identifiers for items it knows
//! about. Items created locally do not have one yet, so they receive a
//! provisional identifier that is exchanged for the remote one on first
//! successful upload. [`ItemId`] makes that distinction a type instead
//! of a string prefix convention, while keeping the `local-<uuid>` wire
//! form for persistence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Wire prefix for provisional identifiers.
const LOCAL_PREFIX: &str = "local-";

/// Maximum filename length in bytes (POSIX NAME_MAX).
pub const NAME_MAX: usize = 255;

// ============================================================================
// ItemId
// ============================================================================

/// Identifier of an item, either assigned by the remote store or
/// provisionally minted on the local side.
///
/// The upload success path is the only place a `Local` identifier is
/// exchanged for a `Remote` one; every index holding the old identifier
/// must be updated in that exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemId {
    /// Opaque identifier assigned by the remote store.
    Remote(String),
    /// Provisional identifier for an item not yet uploaded.
    Local(Uuid),
}

impl ItemId {
    /// Mints a fresh provisional identifier.
    pub fn new_local() -> Self {
        ItemId::Local(Uuid::new_v4())
    }

    /// Wraps a remote identifier string.
    pub fn remote(id: impl Into<String>) -> Self {
        ItemId::Remote(id.into())
    }

    /// The sentinel used as the root item's parent.
    pub fn sentinel() -> Self {
        ItemId::Remote(String::new())
    }

    /// Returns true for the root-parent sentinel.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ItemId::Remote(s) if s.is_empty())
    }

    /// Returns true if this is a provisional local identifier.
    pub fn is_local(&self) -> bool {
        matches!(self, ItemId::Local(_))
    }

    /// Returns the remote identifier string, if any.
    pub fn as_remote(&self) -> Option<&str> {
        match self {
            ItemId::Remote(s) => Some(s.as_str()),
            ItemId::Local(_) => None,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Remote(s) => f.write_str(s),
            ItemId::Local(u) => write!(f, "{}{}", LOCAL_PREFIX, u),
        }
    }
}

impl FromStr for ItemId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(LOCAL_PREFIX) {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                return Ok(ItemId::Local(uuid));
            }
            // A remote id could in principle start with "local-"; fall
            // through and treat it as opaque.
        }
        Ok(ItemId::Remote(s.to_string()))
    }
}

impl Serialize for ItemId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// DeltaCursor
// ============================================================================

/// Opaque position in the remote change feed.
///
/// Handed out by the delta endpoint and persisted verbatim; the cursor
/// is only ever compared for equality and replayed back to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaCursor(String);

impl DeltaCursor {
    pub fn new(token: impl Into<String>) -> Self {
        DeltaCursor(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeltaCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Name validation
// ============================================================================

/// Validates a single path component as an item name.
///
/// Rejects the sentinel names `.` and `..`, the path separator `/`
/// (standalone or embedded), embedded NUL, the empty string, and names
/// longer than [`NAME_MAX`] bytes.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name == "." || name == ".." || name == "/" {
        return Err(CoreError::InvalidName(name.to_string()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(CoreError::InvalidName(name.to_string()));
    }
    if name.len() > NAME_MAX {
        let head: String = name.chars().take(32).collect();
        return Err(CoreError::InvalidName(format!("{}...", head)));
    }
    Ok(())
}

/// Case-insensitive name equality, as enforced by the remote store.
pub fn names_equal_fold(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod item_id_tests {
        use super::*;

        #[test]
        fn test_local_round_trip() {
            let id = ItemId::new_local();
            let wire = id.to_string();
            assert!(wire.starts_with("local-"));
            let parsed: ItemId = wire.parse().unwrap();
            assert_eq!(parsed, id);
            assert!(parsed.is_local());
        }

        #[test]
        fn test_remote_round_trip() {
            let id = ItemId::remote("01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K");
            let parsed: ItemId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
            assert!(!parsed.is_local());
            assert_eq!(parsed.as_remote(), Some("01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K"));
        }

        #[test]
        fn test_remote_id_with_local_prefix_but_no_uuid() {
            // An opaque remote id that happens to start with "local-"
            // must survive parsing unchanged.
            let parsed: ItemId = "local-notauuid".parse().unwrap();
            assert_eq!(parsed, ItemId::remote("local-notauuid"));
        }

        #[test]
        fn test_sentinel() {
            let s = ItemId::sentinel();
            assert!(s.is_sentinel());
            assert!(!ItemId::remote("x").is_sentinel());
            assert!(!ItemId::new_local().is_sentinel());
        }

        #[test]
        fn test_serde_round_trip() {
            let id = ItemId::new_local();
            let json = serde_json::to_string(&id).unwrap();
            let back: ItemId = serde_json::from_str(&json).unwrap();
            assert_eq!(back, id);
        }
    }

    mod name_tests {
        use super::*;

        #[test]
        fn test_sentinel_names_rejected() {
            for bad in [".", "..", "/", ""] {
                assert!(validate_name(bad).is_err(), "{:?} should be rejected", bad);
            }
        }

        #[test]
        fn test_embedded_separator_and_nul_rejected() {
            assert!(validate_name("a/b").is_err());
            assert!(validate_name("a\0b").is_err());
        }

        #[test]
        fn test_long_name_rejected() {
            let name = "x".repeat(NAME_MAX + 1);
            assert!(validate_name(&name).is_err());
            let ok = "x".repeat(NAME_MAX);
            assert!(validate_name(&ok).is_ok());
        }

        #[test]
        fn test_ordinary_names_accepted() {
            for good in ["a.txt", "Ünicode Datei.pdf", ".hidden", "..twodots"] {
                assert!(validate_name(good).is_ok(), "{:?} should be accepted", good);
            }
        }

        #[test]
        fn test_case_fold_equality() {
            assert!(names_equal_fold("Report.DOCX", "report.docx"));
            assert!(!names_equal_fold("a", "b"));
        }
    }
}
