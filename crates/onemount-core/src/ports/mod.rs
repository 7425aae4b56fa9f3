//! Ports: the interfaces the filesystem engine consumes.
//!
//! Production adapters live in `onemount-graph` (the remote store) and
//! `onemount-daemon` (token source, event sink); tests substitute
//! doubles. The engine is ignorant of which is in use.

pub mod auth;
pub mod event_sink;
pub mod remote_store;

pub use auth::{StaticTokenSource, TokenSource};
pub use event_sink::{EventSink, NullEventSink};
pub use remote_store::{
    ChildPage, ChunkRange, ChunkStatus, ContentStream, DeltaPage, DriveQuota, RemoteError,
    RemoteItem, RemoteStore, Subscription, UploadSessionInfo, UploadTarget,
};
