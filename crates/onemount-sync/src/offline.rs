//! Offline mode: connectivity probing and the change journal.
//!
//! A periodic probe against the remote toggles the shared offline
//! flag. While offline, every mutating filesystem operation succeeds
//! locally and appends an [`OfflineChange`] to the journal; reads are
//! served from cached blobs and ghost reads fail with "not available
//! offline". The offline→online edge signals the sync manager to
//! replay the journal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::MetadataStore;
use onemount_core::domain::{ItemId, OfflineChange, OfflineChangeKind};
use onemount_core::ports::RemoteStore;
use onemount_core::CoreError;

// ============================================================================
// ConnectivityMonitor
// ============================================================================

/// Periodic connectivity probe.
pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteStore>,
    online: Arc<AtomicBool>,
    interval: Duration,
    /// Signalled on every offline→online edge.
    reconnected: Arc<Notify>,
}

impl ConnectivityMonitor {
    pub fn new(remote: Arc<dyn RemoteStore>, interval: Duration) -> Self {
        Self {
            remote,
            online: Arc::new(AtomicBool::new(true)),
            interval,
            reconnected: Arc::new(Notify::new()),
        }
    }

    /// Shared flag consulted throughout the engine.
    pub fn online_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.online)
    }

    /// Inverse view for status derivation.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Handle signalled when connectivity returns.
    pub fn reconnected(&self) -> Arc<Notify> {
        Arc::clone(&self.reconnected)
    }

    /// One probe: a cheap authenticated round trip.
    pub async fn probe(&self) -> bool {
        match self.remote.drive_quota().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }

    /// Probes until cancelled, updating the flag and signalling
    /// reconnection edges.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let was_online = self.is_online();
            let now_online = self.probe().await;
            self.online.store(now_online, Ordering::Release);
            match (was_online, now_online) {
                (true, false) => {
                    warn!("connectivity lost, entering offline mode");
                }
                (false, true) => {
                    info!("connectivity restored, scheduling journal replay");
                    self.reconnected.notify_waiters();
                }
                _ => {}
            }
        }
    }
}

// ============================================================================
// OfflineJournal
// ============================================================================

/// Append-only journal of mutations made while offline.
///
/// A thin, intention-revealing wrapper over the journal bucket: the
/// dispatcher records through this, the sync manager drains through
/// the store directly.
pub struct OfflineJournal {
    metadata: MetadataStore,
    online: Arc<AtomicBool>,
}

impl OfflineJournal {
    pub fn new(metadata: MetadataStore, online: Arc<AtomicBool>) -> Self {
        Self { metadata, online }
    }

    /// Whether mutations should journal instead of uploading.
    pub fn is_offline(&self) -> bool {
        !self.online.load(Ordering::Acquire)
    }

    /// Records a mutation performed while offline.
    pub async fn record(
        &self,
        id: &ItemId,
        kind: OfflineChangeKind,
        path: impl Into<String>,
        new_path: Option<String>,
    ) -> Result<i64, CoreError> {
        let mut change = OfflineChange::new(id.clone(), kind, path);
        change.new_path = new_path;
        let seq = self
            .metadata
            .append_offline_change(&mut change)
            .await
            .map_err(CoreError::from)?;
        debug!(%id, ?kind, seq, "offline change journaled");
        Ok(seq)
    }
}
