//! State manager: per-item serialized transitions.
//!
//! All runtime state changes go through [`StateManager::transition`].
//! A per-id async mutex totally orders transitions for one item; the
//! legality table lives on the entry itself, and the updated entry is
//! persisted before the lock is released, so readers never observe a
//! mid-transition record. Every applied transition wakes the item's
//! waiters and reports the derived status to the event sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, warn};

use onemount_cache::MetadataStore;
use onemount_core::domain::{Entry, ItemId, ItemState, StatusContext, TransitionOptions};
use onemount_core::ports::EventSink;
use onemount_core::CoreError;

/// Serializes transitions and wakes waiters per item.
pub struct StateManager {
    metadata: MetadataStore,
    events: Arc<dyn EventSink>,
    locks: DashMap<ItemId, Arc<Mutex<()>>>,
    waiters: DashMap<ItemId, Arc<Notify>>,
    /// Shared connectivity flag (true = online), folded into status
    /// derivation.
    online: Arc<AtomicBool>,
}

impl StateManager {
    pub fn new(metadata: MetadataStore, events: Arc<dyn EventSink>, online: Arc<AtomicBool>) -> Self {
        Self {
            metadata,
            events,
            locks: DashMap::new(),
            waiters: DashMap::new(),
            online,
        }
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    fn lock_for(&self, id: &ItemId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notify_for(&self, id: &ItemId) -> Arc<Notify> {
        self.waiters
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Acquires the per-item lock. Compound operations (create, rename,
    /// unlink) hold this across their read-modify-write.
    pub async fn lock(&self, id: &ItemId) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    /// Applies a legal transition, persists the entry, wakes waiters.
    ///
    /// Illegal transitions return [`CoreError::InvalidTransition`] with
    /// the entry untouched; the caller logs and absorbs them, they are
    /// never surfaced to the kernel.
    pub async fn transition(
        &self,
        id: &ItemId,
        target: ItemState,
        opts: TransitionOptions,
    ) -> Result<Entry, CoreError> {
        let guard = self.lock(id).await;
        let result = self.transition_locked(id, target, opts).await;
        drop(guard);
        result
    }

    /// Transition body for callers that already hold the per-item lock.
    pub async fn transition_locked(
        &self,
        id: &ItemId,
        target: ItemState,
        opts: TransitionOptions,
    ) -> Result<Entry, CoreError> {
        let mut entry = self.metadata.get(id).await.map_err(CoreError::from)?;
        let from = entry.state();
        entry.apply_transition(target, &opts)?;
        self.metadata.save(&entry).await.map_err(CoreError::from)?;
        debug!(%id, from = %from, to = %target, "state transition");

        self.wake(id);
        self.events
            .file_status_changed(id, entry.status(self.status_context()));
        Ok(entry)
    }

    /// Wakes every waiter parked on `id`.
    pub fn wake(&self, id: &ItemId) {
        if let Some(notify) = self.waiters.get(id) {
            notify.notify_waiters();
        }
    }

    /// Blocks until `predicate` accepts the entry or the deadline
    /// elapses. Re-checks on every transition of the item.
    pub async fn wait_until<F>(
        &self,
        id: &ItemId,
        deadline: Duration,
        predicate: F,
    ) -> Result<Entry, CoreError>
    where
        F: Fn(&Entry) -> bool,
    {
        let notify = self.notify_for(id);
        let wait = async {
            loop {
                // Arm before checking so a transition between the check
                // and the park cannot be missed.
                let notified = notify.notified();
                let entry = self.metadata.get(id).await.map_err(CoreError::from)?;
                if predicate(&entry) {
                    return Ok(entry);
                }
                notified.await;
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%id, "wait deadline exceeded");
                Err(CoreError::Cancelled)
            }
        }
    }

    /// Blocks until the item settles out of its transfer states
    /// (`Hydrated`, `DirtyLocal` with no active session, or `Error`).
    pub async fn wait_settled(&self, id: &ItemId, deadline: Duration) -> Result<Entry, CoreError> {
        self.wait_until(id, deadline, |e| {
            matches!(
                e.state(),
                ItemState::Hydrated | ItemState::Error | ItemState::Conflict
            )
        })
        .await
    }

    /// Status context reflecting current connectivity.
    pub fn status_context(&self) -> StatusContext {
        StatusContext {
            offline: !self.online.load(Ordering::Acquire),
            ..Default::default()
        }
    }

    /// Drops lock/waiter registrations for a purged item.
    pub fn forget(&self, id: &ItemId) {
        self.locks.remove(id);
        self.waiters.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use onemount_cache::DatabasePool;
    use onemount_core::domain::ItemKind;
    use onemount_core::ports::NullEventSink;

    async fn manager() -> StateManager {
        let pool = DatabasePool::in_memory().await.unwrap();
        StateManager::new(
            MetadataStore::new(pool),
            Arc::new(NullEventSink),
            Arc::new(AtomicBool::new(true)),
        )
    }

    fn ghost(id: &str) -> Entry {
        Entry::from_remote(
            ItemId::remote(id),
            ItemId::remote("ROOT"),
            "f.txt",
            ItemKind::File,
            10,
            Utc::now(),
            Some("\"e1\"".into()),
            None,
        )
    }

    #[tokio::test]
    async fn transition_persists_entry() {
        let mgr = manager().await;
        mgr.metadata().save(&ghost("A")).await.unwrap();

        let entry = mgr
            .transition(
                &ItemId::remote("A"),
                ItemState::Hydrating,
                TransitionOptions::hydration_worker("w1"),
            )
            .await
            .unwrap();
        assert_eq!(entry.state(), ItemState::Hydrating);

        let reloaded = mgr.metadata().get(&ItemId::remote("A")).await.unwrap();
        assert_eq!(reloaded.state(), ItemState::Hydrating);
        assert_eq!(reloaded.hydration().worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_entry_unchanged() {
        let mgr = manager().await;
        mgr.metadata().save(&ghost("A")).await.unwrap();

        let err = mgr
            .transition(
                &ItemId::remote("A"),
                ItemState::Hydrated,
                TransitionOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let reloaded = mgr.metadata().get(&ItemId::remote("A")).await.unwrap();
        assert_eq!(reloaded.state(), ItemState::Ghost);
    }

    #[tokio::test]
    async fn wait_until_wakes_on_transition() {
        let mgr = Arc::new(manager().await);
        mgr.metadata().save(&ghost("A")).await.unwrap();
        let id = ItemId::remote("A");

        let waiter = {
            let mgr = Arc::clone(&mgr);
            let id = id.clone();
            tokio::spawn(async move {
                mgr.wait_settled(&id, Duration::from_secs(5)).await
            })
        };

        mgr.transition(&id, ItemState::Hydrating, TransitionOptions::hydration_worker("w"))
            .await
            .unwrap();
        mgr.transition(&id, ItemState::Hydrated, TransitionOptions::default())
            .await
            .unwrap();

        let entry = waiter.await.unwrap().unwrap();
        assert_eq!(entry.state(), ItemState::Hydrated);
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let mgr = manager().await;
        mgr.metadata().save(&ghost("A")).await.unwrap();
        let err = mgr
            .wait_settled(&ItemId::remote("A"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn concurrent_transitions_are_totally_ordered() {
        let mgr = Arc::new(manager().await);
        mgr.metadata().save(&ghost("A")).await.unwrap();
        let id = ItemId::remote("A");

        // Two racers both try Ghost→Hydrating; exactly one wins.
        let mut wins = 0;
        let mut handles = Vec::new();
        for n in 0..2 {
            let mgr = Arc::clone(&mgr);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                mgr.transition(
                    &id,
                    ItemState::Hydrating,
                    TransitionOptions::hydration_worker(format!("w{}", n)),
                )
                .await
            }));
        }
        for h in handles {
            if h.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
