//! Download manager: on-demand hydration.
//!
//! A bounded worker pool drains a three-level priority queue of item
//! ids. At most one hydration per id is ever queued or in flight; a
//! second request for the same id while one is pending is a no-op.
//! Workers stream remote content into a partial blob, verify the
//! QuickXOR against the entry's recorded hash, and promote the blob
//! atomically, so a cancelled or failed hydration never corrupts the
//! content store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::{ContentStore, PartialBlob};
use onemount_core::domain::{
    Entry, ItemId, ItemState, TransferKind, TransferPriority, TransitionOptions,
};
use onemount_core::ports::{EventSink, RemoteError, RemoteStore};
use onemount_core::CoreError;

use crate::backoff::BackoffPolicy;
use crate::state::StateManager;

// ============================================================================
// Priority queue
// ============================================================================

/// Three-level FIFO with a wakeup for idle workers.
struct PriorityQueue {
    levels: Mutex<[VecDeque<ItemId>; 3]>,
    available: Notify,
}

impl PriorityQueue {
    fn new() -> Self {
        Self {
            levels: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            available: Notify::new(),
        }
    }

    fn slot(priority: TransferPriority) -> usize {
        match priority {
            TransferPriority::High => 0,
            TransferPriority::Normal => 1,
            TransferPriority::Low => 2,
        }
    }

    async fn push(&self, id: ItemId, priority: TransferPriority) {
        self.levels.lock().await[Self::slot(priority)].push_back(id);
        self.available.notify_one();
    }

    /// Pops the highest-priority id, waiting if the queue is empty.
    async fn pop(&self, cancel: &CancellationToken) -> Option<ItemId> {
        loop {
            let waiter = self.available.notified();
            {
                let mut levels = self.levels.lock().await;
                for level in levels.iter_mut() {
                    if let Some(id) = level.pop_front() {
                        return Some(id);
                    }
                }
            }
            tokio::select! {
                _ = waiter => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

// ============================================================================
// DownloadManager
// ============================================================================

/// Hydrates ghost items on demand.
pub struct DownloadManager {
    state: Arc<StateManager>,
    content: Arc<ContentStore>,
    remote: Arc<dyn RemoteStore>,
    events: Arc<dyn EventSink>,
    queue: Arc<PriorityQueue>,
    /// Queued or running hydrations; the at-most-once guard.
    in_flight: Arc<DashMap<ItemId, CancellationToken>>,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        state: Arc<StateManager>,
        content: Arc<ContentStore>,
        remote: Arc<dyn RemoteStore>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            content,
            remote,
            events,
            queue: Arc::new(PriorityQueue::new()),
            in_flight: Arc::new(DashMap::new()),
            backoff: BackoffPolicy::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts `n` hydration workers.
    pub fn spawn_workers(self: &Arc<Self>, n: usize) {
        for worker in 0..n {
            let mgr = Arc::clone(self);
            let label = format!("dl-{}", worker);
            tokio::spawn(async move {
                mgr.worker_loop(label).await;
            });
        }
    }

    /// Stops the pool; in-flight hydrations abort cooperatively.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
    }

    /// Enqueues a hydration unless one is already pending for `id`.
    ///
    /// Non-blocking; returns whether a new job was enqueued.
    pub async fn request(&self, id: &ItemId, priority: TransferPriority) -> bool {
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.in_flight.entry(id.clone()) {
            MapEntry::Occupied(_) => return false,
            MapEntry::Vacant(slot) => {
                slot.insert(self.shutdown.child_token());
            }
        }
        debug!(%id, ?priority, "hydration queued");
        self.queue.push(id.clone(), priority).await;
        true
    }

    /// Whether a hydration for `id` is queued or running.
    pub fn is_pending(&self, id: &ItemId) -> bool {
        self.in_flight.contains_key(id)
    }

    /// Cancels a pending hydration.
    pub fn cancel(&self, id: &ItemId) {
        if let Some(token) = self.in_flight.get(id) {
            token.cancel();
        }
    }

    /// Blocks until `id` reaches `Hydrated` or settles in failure.
    pub async fn wait(&self, id: &ItemId, deadline: Duration) -> Result<Entry, CoreError> {
        let in_flight = Arc::clone(&self.in_flight);
        let id_for_predicate = id.clone();
        let entry = self
            .state
            .wait_until(id, deadline, move |e| {
                matches!(e.state(), ItemState::Hydrated | ItemState::Error)
                    || !in_flight.contains_key(&id_for_predicate)
            })
            .await?;
        match entry.state() {
            ItemState::Hydrated | ItemState::DirtyLocal => Ok(entry),
            ItemState::Error => Err(CoreError::Io(
                entry
                    .last_error()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "hydration failed".to_string()),
            )),
            _ => Err(CoreError::Cancelled),
        }
    }

    async fn worker_loop(self: Arc<Self>, label: String) {
        loop {
            let id = match self.queue.pop(&self.shutdown).await {
                Some(id) => id,
                None => return,
            };
            self.hydrate(&id, &label).await;
            self.in_flight.remove(&id);
            // Waiters parked on a cancelled/skipped hydration re-check
            // the in-flight set, not just the state.
            self.state.wake(&id);
        }
    }

    /// Runs one hydration to completion, error, or cancellation.
    async fn hydrate(&self, id: &ItemId, worker: &str) {
        let token = match self.in_flight.get(id) {
            Some(t) => t.value().clone(),
            None => return,
        };

        // Ghost→Hydrating gate. Losing the race (already hydrated,
        // dirty, deleted) is not an error; the job just evaporates.
        let entry = match self
            .state
            .transition(id, ItemState::Hydrating, TransitionOptions::hydration_worker(worker))
            .await
        {
            Ok(entry) => entry,
            Err(CoreError::InvalidTransition { from, .. }) => {
                debug!(%id, from, "hydration skipped, item no longer ghost");
                return;
            }
            Err(e) => {
                warn!(%id, error = %e, "hydration could not start");
                return;
            }
        };

        let expected = entry.quick_xor().cloned();
        let result = self
            .backoff
            .retry("hydration", &token, || {
                self.attempt(id, expected.as_ref().map(|h| h.as_str()))
            })
            .await;

        match result {
            Ok(partial) => {
                let size = partial.len();
                let hash = partial.hash();
                if let Err(e) = self.content.commit_partial(partial) {
                    self.fail(id, &format!("blob commit failed: {}", e), false).await;
                    return;
                }
                let update = self
                    .state
                    .metadata()
                    .update(id, |e| {
                        e.set_size(size);
                        e.set_quick_xor(Some(hash.clone()));
                    })
                    .await;
                if let Err(e) = update {
                    self.fail(id, &format!("metadata update failed: {}", e), false).await;
                    return;
                }
                if let Err(e) = self
                    .state
                    .transition(id, ItemState::Hydrated, TransitionOptions::default())
                    .await
                {
                    warn!(%id, error = %e, "post-hydration transition rejected");
                    return;
                }
                self.events.metric("hydrations_completed", 1.0);
                info!(%id, size, "hydration complete");
            }
            Err(CoreError::Cancelled) => {
                debug!(%id, "hydration cancelled, returning to ghost");
                let _ = self
                    .state
                    .transition(id, ItemState::Ghost, TransitionOptions::default())
                    .await;
            }
            Err(e) => {
                self.fail(id, &e.to_string(), e.is_transient()).await;
            }
        }
    }

    /// One download attempt: stream into a fresh partial and verify.
    async fn attempt(
        &self,
        id: &ItemId,
        expected_hash: Option<&str>,
    ) -> Result<PartialBlob, RemoteError> {
        let remote_id = id
            .as_remote()
            .ok_or_else(|| RemoteError::NotFound(format!("{} has no remote content", id)))?;

        let mut partial = self
            .content
            .begin_partial(id)
            .map_err(|e| RemoteError::Transient(format!("partial blob: {}", e)))?;

        let mut stream = self.remote.download_content(remote_id).await?;
        while let Some(chunk) = stream.next().await {
            if self
                .in_flight
                .get(id)
                .map(|t| t.is_cancelled())
                .unwrap_or(true)
            {
                let _ = self.content.discard_partial(partial);
                return Err(RemoteError::Transient("cancelled".into()));
            }
            match chunk {
                Ok(bytes) => {
                    if let Err(e) = partial.append(&bytes) {
                        let _ = self.content.discard_partial(partial);
                        return Err(RemoteError::Transient(format!("blob write: {}", e)));
                    }
                }
                Err(e) => {
                    let _ = self.content.discard_partial(partial);
                    return Err(e);
                }
            }
        }

        if let Some(expected) = expected_hash {
            let actual = partial.hash();
            if actual.as_str() != expected {
                let _ = self.content.discard_partial(partial);
                return Err(RemoteError::Transient(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected,
                    actual.as_str()
                )));
            }
        }
        Ok(partial)
    }

    async fn fail(&self, id: &ItemId, message: &str, temporary: bool) {
        warn!(%id, %message, "hydration failed");
        self.events.error(Some(id), message);
        let _ = self
            .state
            .transition(
                id,
                ItemState::Error,
                TransitionOptions::failure(TransferKind::Hydration, message, temporary),
            )
            .await;
    }
}
