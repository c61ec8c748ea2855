//! Collaborator traits
//!
//! The engine talks to exactly two external systems: a durable store for the
//! queue and status records, and the chain RPC. Both sit behind these traits so
//! the engine can run against sled + NEAR in production and in-memory doubles
//! in tests.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::transfer::error::{ChainError, StoreError};
use crate::transfer::slots::SigningSlot;
use crate::transfer::types::{QueuedTransfer, SubmitOutcome, TransferAction, TransferId, TransferStatus};

/// Durable queue + status store
///
/// Implementations own their reconnection/backoff policy; an `Err` means the
/// store gave up on this operation.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Append a transfer to the tail of the durable queue.
    /// An entry with the same identifier is replaced and moved to the tail.
    async fn enqueue(&self, transfer: &QueuedTransfer) -> Result<(), StoreError>;

    /// Remove and return up to `count` entries from the front of the queue
    async fn dequeue_front(&self, count: usize) -> Result<Vec<QueuedTransfer>, StoreError>;

    /// Remove the given identifiers from the queue, wherever they are.
    /// Returns how many entries were removed.
    async fn remove_queued(&self, ids: &[TransferId]) -> Result<usize, StoreError>;

    async fn queue_length(&self) -> Result<usize, StoreError>;

    /// Upsert a status record
    async fn set_status(&self, status: &TransferStatus) -> Result<(), StoreError>;

    async fn get_status(&self, id: &TransferId) -> Result<Option<TransferStatus>, StoreError>;

    /// Delete a status record. Returns true if it existed.
    async fn delete_status(&self, id: &TransferId) -> Result<bool, StoreError>;

    async fn all_statuses(&self) -> Result<HashMap<TransferId, TransferStatus>, StoreError>;

    /// Full queue contents in queue order (startup recovery)
    async fn recover_queue(&self) -> Result<Vec<QueuedTransfer>, StoreError>;

    async fn health_check(&self) -> bool;

    /// Flush and release the underlying connection
    async fn close(&self) -> Result<(), StoreError>;

    /// Get store name for logging
    fn name(&self) -> &str;
}

/// Source of authoritative starting sequence numbers (nonces)
#[async_trait]
pub trait SequenceProvider: Send + Sync {
    /// Last nonce the chain has seen for `(account_id, public_key)`
    async fn query_starting_sequence(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<u64, ChainError>;
}

/// Chain RPC collaborator
#[async_trait]
pub trait ChainRpc: SequenceProvider {
    /// Sign one multi-action transaction with the slot's key at
    /// `slot.submit_nonce()` and submit it to `contract_id`.
    async fn submit(
        &self,
        account_id: &str,
        contract_id: &str,
        actions: &[TransferAction],
        slot: &SigningSlot,
    ) -> Result<SubmitOutcome, ChainError>;

    /// Get chain client name for logging
    fn name(&self) -> &str;
}
