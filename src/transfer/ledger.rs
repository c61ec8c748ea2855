//! Transfer Ledger
//!
//! In-memory map from transfer identifier to status, the source of truth for
//! status queries. Every change is written through to the durable store before
//! it becomes visible in the map.
//!
//! All transitions go through [`TransferLedger::apply`], which serialises
//! writers of the same transfer so that a terminal update and a re-queue can
//! never interleave. Writers are sharded by identifier: a slow store write for
//! one transfer only holds up transfers that hash to the same shard.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;

use crate::transfer::adapters::TransferStore;
use crate::transfer::error::LedgerError;
use crate::transfer::state::{transition, TransferEvent, TransferState};
use crate::transfer::types::{TransferId, TransferStatus};

const WRITER_SHARDS: usize = 64;

pub struct TransferLedger {
    statuses: RwLock<HashMap<TransferId, TransferStatus>>,
    writers: Vec<Mutex<()>>,
    store: Arc<dyn TransferStore>,
}

impl TransferLedger {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            writers: (0..WRITER_SHARDS).map(|_| Mutex::new(())).collect(),
            store,
        }
    }

    /// Writer lock guarding every update of `id`
    fn writer(&self, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.writers[(hasher.finish() as usize) % self.writers.len()]
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TransferId, TransferStatus>> {
        self.statuses.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TransferId, TransferStatus>> {
        self.statuses.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the in-memory map with statuses loaded from the store
    pub fn rehydrate(&self, statuses: HashMap<TransferId, TransferStatus>) {
        *self.write() = statuses;
    }

    /// Record a new status. The store write must succeed before the status
    /// is published.
    pub async fn insert(&self, status: TransferStatus) -> Result<TransferStatus, LedgerError> {
        let _writer = self.writer(status.transfer_id.as_str()).lock().await;
        self.store.set_status(&status).await?;
        self.write().insert(status.transfer_id.clone(), status.clone());
        Ok(status)
    }

    /// Apply one state transition and return the updated record.
    ///
    /// A store failure is logged and the in-memory record is still updated;
    /// durability is degraded until the store recovers.
    pub async fn apply(
        &self,
        id: &TransferId,
        event: TransferEvent,
        now_ms: i64,
    ) -> Result<TransferStatus, LedgerError> {
        let _writer = self.writer(id.as_str()).lock().await;

        let current = self
            .get(id.as_str())
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        let from = current.state;
        let next = apply_event(current, &event, now_ms).ok_or(LedgerError::InvalidTransition {
            id: id.clone(),
            from,
            event: event.name(),
        })?;

        if let Err(e) = self.store.set_status(&next).await {
            log::error!(
                "Failed to persist status of {} ({} -> {}): {}",
                id,
                from,
                next.state,
                e
            );
        }
        self.write().insert(id.clone(), next.clone());

        log::debug!("Transfer {} status: {} -> {}", id, from, next.state);
        Ok(next)
    }

    /// Delete a status from store and memory
    pub async fn remove(&self, id: &TransferId) -> Result<bool, LedgerError> {
        let _writer = self.writer(id.as_str()).lock().await;
        self.store.delete_status(id).await?;
        Ok(self.write().remove(id.as_str()).is_some())
    }

    pub fn get(&self, id: &str) -> Option<TransferStatus> {
        self.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run `f` over all statuses under one read lock
    pub fn with_statuses<R>(&self, f: impl FnOnce(&HashMap<TransferId, TransferStatus>) -> R) -> R {
        f(&self.read())
    }
}

/// Build the record that results from `event`, or `None` if the event is not
/// valid in the record's current state
fn apply_event(mut status: TransferStatus, event: &TransferEvent, now_ms: i64) -> Option<TransferStatus> {
    status.state = transition(status.state, event)?;

    match event {
        TransferEvent::Dispatch => {
            status.processing_at = Some(now_ms);
        }
        TransferEvent::Confirm { tx_hash } => {
            status.transaction_hash = Some(tx_hash.clone());
            status.error = None;
            status.completed_at = Some(now_ms);
            status.latency_ms = Some(now_ms - status.queued_at);
        }
        TransferEvent::Fail { error } => {
            status.error = Some(error.clone());
            status.completed_at = Some(now_ms);
            status.latency_ms = Some(now_ms - status.queued_at);
        }
        TransferEvent::Requeue { retries } => {
            // Last error is kept for visibility until the next outcome
            status.retries = *retries;
            status.queued_at = now_ms;
            status.processing_at = None;
            status.completed_at = None;
            status.latency_ms = None;
            status.transaction_hash = None;
        }
        TransferEvent::Recover => {
            status.processing_at = None;
        }
    }
    debug_assert!(status.state != TransferState::Confirmed || status.transaction_hash.is_some());
    Some(status)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::transfer::adapters::MemoryTransferStore;
    use crate::transfer::error::StoreError;
    use crate::transfer::types::{QueuedTransfer, TransferRequest};

    /// Memory store whose status writes for one transfer wait until released
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryTransferStore,
        held: std::sync::Mutex<Option<TransferId>>,
        entered: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn hold(&self, id: &TransferId) {
            *self.held.lock().unwrap() = Some(id.clone());
        }
    }

    #[async_trait]
    impl TransferStore for GatedStore {
        async fn enqueue(&self, transfer: &QueuedTransfer) -> Result<(), StoreError> {
            self.inner.enqueue(transfer).await
        }

        async fn dequeue_front(&self, count: usize) -> Result<Vec<QueuedTransfer>, StoreError> {
            self.inner.dequeue_front(count).await
        }

        async fn remove_queued(&self, ids: &[TransferId]) -> Result<usize, StoreError> {
            self.inner.remove_queued(ids).await
        }

        async fn queue_length(&self) -> Result<usize, StoreError> {
            self.inner.queue_length().await
        }

        async fn set_status(&self, status: &TransferStatus) -> Result<(), StoreError> {
            let held = self.held.lock().unwrap().as_ref() == Some(&status.transfer_id);
            if held {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.set_status(status).await
        }

        async fn get_status(&self, id: &TransferId) -> Result<Option<TransferStatus>, StoreError> {
            self.inner.get_status(id).await
        }

        async fn delete_status(&self, id: &TransferId) -> Result<bool, StoreError> {
            self.inner.delete_status(id).await
        }

        async fn all_statuses(&self) -> Result<HashMap<TransferId, TransferStatus>, StoreError> {
            self.inner.all_statuses().await
        }

        async fn recover_queue(&self) -> Result<Vec<QueuedTransfer>, StoreError> {
            self.inner.recover_queue().await
        }

        async fn health_check(&self) -> bool {
            self.inner.health_check().await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.inner.close().await
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    fn setup() -> (Arc<MemoryTransferStore>, TransferLedger, TransferStatus) {
        let store = Arc::new(MemoryTransferStore::new());
        let ledger = TransferLedger::new(store.clone());
        let transfer = QueuedTransfer::new(TransferRequest::new("alice.testnet", "10"), 1_000);
        (store, ledger, TransferStatus::queued(&transfer))
    }

    #[tokio::test]
    async fn test_insert_writes_through() {
        let (store, ledger, status) = setup();
        ledger.insert(status.clone()).await.unwrap();

        assert_eq!(ledger.get(status.transfer_id.as_str()), Some(status.clone()));
        assert_eq!(store.get_status(&status.transfer_id).await.unwrap(), Some(status));
    }

    #[tokio::test]
    async fn test_insert_fails_when_store_down() {
        let (store, ledger, status) = setup();
        store.set_available(false);

        assert!(ledger.insert(status.clone()).await.is_err());
        assert!(ledger.get(status.transfer_id.as_str()).is_none());
    }

    #[tokio::test]
    async fn test_confirm_sets_hash_and_latency() {
        let (store, ledger, status) = setup();
        let id = status.transfer_id.clone();
        ledger.insert(status).await.unwrap();

        ledger.apply(&id, TransferEvent::Dispatch, 1_200).await.unwrap();
        let done = ledger
            .apply(&id, TransferEvent::Confirm { tx_hash: "h1".into() }, 1_750)
            .await
            .unwrap();

        assert_eq!(done.state, TransferState::Confirmed);
        assert_eq!(done.processing_at, Some(1_200));
        assert_eq!(done.completed_at, Some(1_750));
        assert_eq!(done.latency_ms, Some(750));
        assert_eq!(done.transaction_hash.as_deref(), Some("h1"));
        assert_eq!(store.get_status(&id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn test_requeue_resets_record() {
        let (_store, ledger, status) = setup();
        let id = status.transfer_id.clone();
        ledger.insert(status).await.unwrap();

        ledger.apply(&id, TransferEvent::Dispatch, 1_100).await.unwrap();
        ledger
            .apply(&id, TransferEvent::Fail { error: "timeout".into() }, 1_300)
            .await
            .unwrap();
        let again = ledger.apply(&id, TransferEvent::Requeue { retries: 1 }, 1_400).await.unwrap();

        assert_eq!(again.state, TransferState::Queued);
        assert_eq!(again.transfer_id, id);
        assert_eq!(again.retries, 1);
        assert_eq!(again.queued_at, 1_400);
        assert_eq!(again.completed_at, None);
        assert_eq!(again.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let (_store, ledger, status) = setup();
        let id = status.transfer_id.clone();
        ledger.insert(status.clone()).await.unwrap();

        let err = ledger
            .apply(&id, TransferEvent::Confirm { tx_hash: "h".into() }, 2_000)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { from: TransferState::Queued, .. }));
        assert_eq!(ledger.get(id.as_str()), Some(status));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (_store, ledger, _status) = setup();
        let err = ledger
            .apply(&TransferId::new("tx_missing"), TransferEvent::Dispatch, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_apply_survives_store_outage() {
        let (store, ledger, status) = setup();
        let id = status.transfer_id.clone();
        ledger.insert(status).await.unwrap();

        store.set_available(false);
        let processing = ledger.apply(&id, TransferEvent::Dispatch, 1_500).await.unwrap();
        assert_eq!(processing.state, TransferState::Processing);
        assert_eq!(ledger.get(id.as_str()).unwrap().state, TransferState::Processing);

        store.set_available(true);
        // Store still holds the last write that succeeded
        assert_eq!(store.get_status(&id).await.unwrap().unwrap().state, TransferState::Queued);
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, ledger, status) = setup();
        let id = status.transfer_id.clone();
        ledger.insert(status).await.unwrap();

        assert!(ledger.remove(&id).await.unwrap());
        assert!(ledger.is_empty());
        assert!(store.get_status(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_store_write_does_not_block_other_transfers() {
        let store = Arc::new(GatedStore::default());
        let ledger = Arc::new(TransferLedger::new(store.clone()));

        let transfer = QueuedTransfer::new(TransferRequest::new("alice.testnet", "10"), 1_000);
        let slow = TransferStatus::queued(&transfer);
        // Pick a second transfer that lands on a different writer shard
        let fast = (0..)
            .map(|n| {
                let mut status = slow.clone();
                status.transfer_id = TransferId::new(format!("tx_1000_{:016x}", n));
                status
            })
            .find(|s| !std::ptr::eq(ledger.writer(s.transfer_id.as_str()), ledger.writer(slow.transfer_id.as_str())))
            .unwrap();
        ledger.insert(slow.clone()).await.unwrap();
        ledger.insert(fast.clone()).await.unwrap();

        store.hold(&slow.transfer_id);
        let pending = {
            let ledger = ledger.clone();
            let id = slow.transfer_id.clone();
            tokio::spawn(async move { ledger.apply(&id, TransferEvent::Dispatch, 1_100).await })
        };
        store.entered.notified().await;

        let done = tokio::time::timeout(
            Duration::from_secs(1),
            ledger.apply(&fast.transfer_id, TransferEvent::Dispatch, 1_200),
        )
        .await
        .expect("update of another transfer waited on the held store write")
        .unwrap();
        assert_eq!(done.state, TransferState::Processing);
        // Held write is not published before it is persisted
        assert_eq!(ledger.get(slow.transfer_id.as_str()).unwrap().state, TransferState::Queued);

        store.release.notify_one();
        let held = pending.await.unwrap().unwrap();
        assert_eq!(held.state, TransferState::Processing);
        assert_eq!(ledger.get(slow.transfer_id.as_str()), Some(held));
    }
}
