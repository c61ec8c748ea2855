//! Ingestion Queue
//!
//! FIFO of transfers waiting to be batched. A batch is cut when the queue
//! reaches `max_batch_size` on enqueue, or when the scheduler ticks. Cutting a
//! batch removes its members from the queue in the same critical section that
//! reads them, so no transfer is ever handed to two batches.
//!
//! Batches are handed to the dispatcher over an unbounded channel; the
//! dispatcher applies its own concurrency bound.
//!
//! Appends are serialised from the durable write to the in-memory push, so
//! the FIFO holds transfers in the same order as the durable queue and a
//! restart does not reorder them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::common_utils::get_current_timestamp_ms;
use crate::transfer::adapters::TransferStore;
use crate::transfer::error::ServiceError;
use crate::transfer::ledger::TransferLedger;
use crate::transfer::state::TransferEvent;
use crate::transfer::types::{Batch, QueuedTransfer, TransferId, TransferRequest, TransferStatus};

pub struct IngestionQueue {
    pending: Mutex<VecDeque<QueuedTransfer>>,
    order: tokio::sync::Mutex<()>,
    max_batch_size: usize,
    batches: mpsc::UnboundedSender<Batch>,
    store: Arc<dyn TransferStore>,
    ledger: Arc<TransferLedger>,
    accepting: AtomicBool,
}

impl IngestionQueue {
    pub fn new(
        store: Arc<dyn TransferStore>,
        ledger: Arc<TransferLedger>,
        max_batch_size: usize,
        batches: mpsc::UnboundedSender<Batch>,
    ) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            order: tokio::sync::Mutex::new(()),
            max_batch_size: max_batch_size.max(1),
            batches,
            store,
            ledger,
            accepting: AtomicBool::new(true),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedTransfer>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a new request: persist queue entry and status, then append to
    /// the FIFO. Nothing is queued in memory unless both writes succeed.
    pub async fn enqueue(&self, request: TransferRequest) -> Result<TransferStatus, ServiceError> {
        if !self.is_accepting() {
            return Err(ServiceError::ShuttingDown);
        }

        let _order = self.order.lock().await;
        let transfer = QueuedTransfer::new(request, get_current_timestamp_ms());
        self.store.enqueue(&transfer).await?;

        let status = match self.ledger.insert(TransferStatus::queued(&transfer)).await {
            Ok(status) => status,
            Err(e) => {
                if let Err(undo) = self.store.remove_queued(&[transfer.id.clone()]).await {
                    log::warn!("Failed to roll back queue entry {}: {}", transfer.id, undo);
                }
                return Err(e.into());
            }
        };

        log::debug!(
            "Queued transfer {} to {} ({})",
            transfer.id,
            transfer.request.receiver_id,
            transfer.request.amount
        );
        self.push(transfer);
        Ok(status)
    }

    /// Put a failed transfer back at the tail for another attempt.
    ///
    /// `transfer` is the next-attempt record (same identifier, bumped
    /// counter). A store failure here is logged; the transfer is still
    /// retried in memory.
    pub async fn requeue(&self, transfer: QueuedTransfer) -> Result<(), ServiceError> {
        let _order = self.order.lock().await;
        if let Err(e) = self.store.enqueue(&transfer).await {
            log::error!("Failed to persist requeue of {}: {}", transfer.id, e);
        }
        self.ledger
            .apply(&transfer.id, TransferEvent::Requeue { retries: transfer.retries }, transfer.timestamp)
            .await?;

        log::info!("Re-queued transfer {} (attempt {})", transfer.id, transfer.retries + 1);
        self.push(transfer);
        Ok(())
    }

    /// Drop finished transfers from the durable queue. Entries that cannot be
    /// removed now are cleaned up by the next startup reconciliation.
    pub async fn acknowledge(&self, ids: &[TransferId]) {
        if ids.is_empty() {
            return;
        }
        match self.store.remove_queued(ids).await {
            Ok(removed) if removed < ids.len() => log::debug!(
                "Acknowledged {} of {} transfers (others already removed)",
                removed,
                ids.len()
            ),
            Ok(_) => {}
            Err(e) => log::error!("Failed to remove {} finished transfers from queue: {}", ids.len(), e),
        }
    }

    /// Load recovered entries in stored order without persisting them again
    pub fn restore(&self, transfers: Vec<QueuedTransfer>) {
        if transfers.is_empty() {
            return;
        }
        log::info!("Restoring {} queued transfers", transfers.len());
        self.pending().extend(transfers);
    }

    fn push(&self, transfer: QueuedTransfer) {
        let len = {
            let mut pending = self.pending();
            pending.push_back(transfer);
            pending.len()
        };
        if len >= self.max_batch_size {
            self.flush();
        }
    }

    /// Cut one batch of `min(max_batch_size, len)` transfers from the front
    /// and hand it to the dispatcher. Returns the batch size, or `None` if
    /// the queue was empty.
    pub fn flush(&self) -> Option<usize> {
        let mut pending = self.pending();
        if pending.is_empty() {
            return None;
        }

        let take = pending.len().min(self.max_batch_size);
        let transfers: Vec<QueuedTransfer> = pending.drain(..take).collect();
        let batch = Batch::new(transfers, get_current_timestamp_ms());
        log::debug!("Cut batch {} with {} transfers", batch.id, batch.len());

        // Sent under the queue lock so batches reach the dispatcher in FIFO order
        if let Err(mpsc::error::SendError(batch)) = self.batches.send(batch) {
            log::warn!("Dispatcher is gone, keeping {} transfers queued", batch.len());
            for transfer in batch.transfers.into_iter().rev() {
                pending.push_front(transfer);
            }
            return None;
        }
        Some(take)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting new requests. Queued entries stay in the durable queue.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}
