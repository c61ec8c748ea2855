//! In-memory transfer store
//!
//! Same contract as the sled store, kept entirely in process. Used by tests
//! and dry runs; `set_available(false)` makes every operation fail so tests can
//! exercise store outages.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::traits::TransferStore;
use crate::transfer::error::StoreError;
use crate::transfer::types::{QueuedTransfer, TransferId, TransferStatus};

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueuedTransfer>,
    statuses: HashMap<TransferId, TransferStatus>,
}

pub struct MemoryTransferStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryTransferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn enqueue(&self, transfer: &QueuedTransfer) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        inner.queue.retain(|t| t.id != transfer.id);
        inner.queue.push_back(transfer.clone());
        Ok(())
    }

    async fn dequeue_front(&self, count: usize) -> Result<Vec<QueuedTransfer>, StoreError> {
        let mut inner = self.inner()?;
        let take = count.min(inner.queue.len());
        Ok(inner.queue.drain(..take).collect())
    }

    async fn remove_queued(&self, ids: &[TransferId]) -> Result<usize, StoreError> {
        let mut inner = self.inner()?;
        let before = inner.queue.len();
        inner.queue.retain(|t| !ids.contains(&t.id));
        Ok(before - inner.queue.len())
    }

    async fn queue_length(&self) -> Result<usize, StoreError> {
        Ok(self.inner()?.queue.len())
    }

    async fn set_status(&self, status: &TransferStatus) -> Result<(), StoreError> {
        self.inner()?
            .statuses
            .insert(status.transfer_id.clone(), status.clone());
        Ok(())
    }

    async fn get_status(&self, id: &TransferId) -> Result<Option<TransferStatus>, StoreError> {
        Ok(self.inner()?.statuses.get(id).cloned())
    }

    async fn delete_status(&self, id: &TransferId) -> Result<bool, StoreError> {
        Ok(self.inner()?.statuses.remove(id).is_some())
    }

    async fn all_statuses(&self) -> Result<HashMap<TransferId, TransferStatus>, StoreError> {
        Ok(self.inner()?.statuses.clone())
    }

    async fn recover_queue(&self) -> Result<Vec<QueuedTransfer>, StoreError> {
        Ok(self.inner()?.queue.iter().cloned().collect())
    }

    async fn health_check(&self) -> bool {
        self.inner().is_ok()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::TransferRequest;

    fn transfer(n: u32) -> QueuedTransfer {
        QueuedTransfer::new(TransferRequest::new(format!("u{}.testnet", n), "1"), n as i64)
    }

    #[tokio::test]
    async fn test_queue_order_and_removal_by_id() {
        let store = MemoryTransferStore::new();
        let (a, b, c) = (transfer(1), transfer(2), transfer(3));
        for t in [&a, &b, &c] {
            store.enqueue(t).await.unwrap();
        }

        assert_eq!(store.remove_queued(&[b.id.clone()]).await.unwrap(), 1);
        assert_eq!(store.recover_queue().await.unwrap(), vec![a.clone(), c.clone()]);

        // Re-enqueue moves the entry to the tail
        store.enqueue(&a.next_attempt(10)).await.unwrap();
        let ids: Vec<_> = store.recover_queue().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![c.id.clone(), a.id.clone()]);

        let front = store.dequeue_front(5).await.unwrap();
        assert_eq!(front.len(), 2);
        assert_eq!(store.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outage_and_close() {
        let store = MemoryTransferStore::new();
        store.set_available(false);
        assert!(!store.health_check().await);
        assert!(matches!(store.queue_length().await, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        store.close().await.unwrap();
        assert!(matches!(store.queue_length().await, Err(StoreError::Closed)));
    }
}
