//! Event sink port.
//!
//! One capability decouples the engine from whatever surfaces status
//! to users: per-file status changes, surfaced errors, and counters.
//! The daemon wires a Prometheus-backed implementation; tests use
//! [`NullEventSink`]. Methods are synchronous fire-and-forget so call
//! sites never block on observability.

use crate::domain::ids::ItemId;
use crate::domain::item::FileStatus;

/// Receives engine events.
pub trait EventSink: Send + Sync {
    /// A file's user-visible status changed.
    fn file_status_changed(&self, id: &ItemId, status: FileStatus);

    /// A non-transient error surfaced.
    fn error(&self, id: Option<&ItemId>, message: &str);

    /// A counter-style metric.
    fn metric(&self, name: &'static str, value: f64);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn file_status_changed(&self, _id: &ItemId, _status: FileStatus) {}
    fn error(&self, _id: Option<&ItemId>, _message: &str) {}
    fn metric(&self, _name: &'static str, _value: f64) {}
}
