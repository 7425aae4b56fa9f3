//! Microsoft Graph adapter: the production [`RemoteStore`].
//!
//! The [`client`] module owns the authenticated HTTP plumbing (bearer
//! tokens from the [`TokenSource`] port, client-side rate limiting,
//! HTTP-status-to-error-kind classification). The [`items`], [`upload`]
//! and [`delta`] modules implement the endpoint groups, and
//! [`provider::GraphStore`] assembles them behind the port trait.
//! [`webhook`] carries the change-notification subscription lifecycle
//! and the validation listener.
//!
//! [`RemoteStore`]: onemount_core::ports::RemoteStore
//! [`TokenSource`]: onemount_core::ports::TokenSource

pub mod client;
pub mod delta;
pub mod items;
pub mod provider;
pub mod upload;
pub mod webhook;

pub use client::GraphClient;
pub use provider::GraphStore;
pub use webhook::{WebhookListener, WebhookNotification};
