//! Status extended attributes.
//!
//! The `user.onemount.*` namespace is synthesized from the entry's
//! state and the transfer managers' runtime knowledge, never stored:
//!
//! - `user.onemount.status` — one of Cloud, Local, LocalModified,
//!   Syncing, Downloading, OutofSync, Error, Conflict.
//! - `user.onemount.error` — present only in the Error status; the
//!   human-readable failure message.
//!
//! All other xattr names are backed by the entry's persisted map.

use onemount_core::domain::{Entry, FileStatus, StatusContext};

/// Synthesized namespace prefix.
pub const XATTR_NAMESPACE: &str = "user.onemount.";

/// Status attribute name.
pub const XATTR_STATUS: &str = "user.onemount.status";

/// Error-message attribute name.
pub const XATTR_ERROR: &str = "user.onemount.error";

/// Whether a name belongs to the synthesized namespace.
pub fn is_synthesized(name: &str) -> bool {
    name.starts_with(XATTR_NAMESPACE)
}

/// Value of a synthesized attribute, `None` when absent.
pub fn synthesized_value(entry: &Entry, ctx: StatusContext, name: &str) -> Option<Vec<u8>> {
    match name {
        XATTR_STATUS => Some(entry.status(ctx).as_str().as_bytes().to_vec()),
        XATTR_ERROR => {
            if entry.status(ctx) != FileStatus::Error {
                return None;
            }
            entry
                .last_error()
                .map(|e| e.message.as_bytes().to_vec())
                .or_else(|| Some(b"unknown error".to_vec()))
        }
        _ => None,
    }
}

/// Full attribute listing: synthesized names plus the entry's own.
pub fn list_names(entry: &Entry, ctx: StatusContext) -> Vec<String> {
    let mut names = vec![XATTR_STATUS.to_string()];
    if entry.status(ctx) == FileStatus::Error {
        names.push(XATTR_ERROR.to_string());
    }
    let mut own: Vec<String> = entry.xattrs().keys().cloned().collect();
    own.sort();
    names.extend(own);
    names
}

/// Encodes a listing into the NUL-separated xattr wire form.
pub fn encode_list(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use onemount_core::domain::item::ErrorDetails;
    use onemount_core::domain::{ItemId, ItemKind, ItemState};

    fn entry() -> Entry {
        Entry::from_remote(
            ItemId::remote("F"),
            ItemId::remote("ROOT"),
            "a.txt",
            ItemKind::File,
            12,
            Utc::now(),
            None,
            None,
        )
    }

    #[test]
    fn test_status_value_for_ghost() {
        let e = entry();
        let v = synthesized_value(&e, StatusContext::default(), XATTR_STATUS).unwrap();
        assert_eq!(v, b"Cloud");
    }

    #[test]
    fn test_status_value_for_hydrated() {
        let mut e = entry();
        e.force_state(ItemState::Hydrated);
        let v = synthesized_value(&e, StatusContext::default(), XATTR_STATUS).unwrap();
        assert_eq!(v, b"Local");
    }

    #[test]
    fn test_error_attribute_only_in_error_status() {
        let mut e = entry();
        assert!(synthesized_value(&e, StatusContext::default(), XATTR_ERROR).is_none());

        e.force_state(ItemState::DirtyLocal);
        e.set_last_error(Some(ErrorDetails {
            message: "upload failed: 507".into(),
            temporary: false,
            origin: None,
        }));
        let v = synthesized_value(&e, StatusContext::default(), XATTR_ERROR).unwrap();
        assert_eq!(v, b"upload failed: 507");
    }

    #[test]
    fn test_listing_includes_own_attributes() {
        let mut e = entry();
        e.set_xattr("user.tag", b"blue".to_vec());
        let names = list_names(&e, StatusContext::default());
        assert_eq!(names, vec!["user.onemount.status", "user.tag"]);
        let encoded = encode_list(&names);
        assert_eq!(
            encoded,
            b"user.onemount.status\0user.tag\0".to_vec()
        );
    }
}
