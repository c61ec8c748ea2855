//! Durable transfer store on sled
//!
//! Three trees:
//! - `queue`:       sequence (u64 BE) -> QueuedTransfer JSON, iterated in order
//! - `queue_index`: transfer id -> sequence, so entries can be removed by id
//! - `statuses`:    transfer id -> TransferStatus JSON
//!
//! Queue and index are always changed in one transaction. Transient storage
//! errors are retried a bounded number of times with linear backoff.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};

use super::traits::TransferStore;
use crate::transfer::error::StoreError;
use crate::transfer::types::{QueuedTransfer, TransferId, TransferStatus};

const QUEUE_TREE: &str = "queue";
const INDEX_TREE: &str = "queue_index";
const STATUS_TREE: &str = "statuses";

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_STEP_MS: u64 = 50;
const RETRY_CAP_MS: u64 = 2_000;

type TxResult<T> = Result<T, ConflictableTransactionError<()>>;

fn unavailable(e: sled::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn tx_error(e: TransactionError<()>) -> StoreError {
    match e {
        TransactionError::Abort(()) => StoreError::Unavailable("transaction aborted".to_string()),
        TransactionError::Storage(e) => unavailable(e),
    }
}

pub struct SledTransferStore {
    db: Db,
    queue: Tree,
    index: Tree,
    statuses: Tree,
    max_retries: u32,
    closed: AtomicBool,
}

impl SledTransferStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(unavailable)?;
        let queue = db.open_tree(QUEUE_TREE).map_err(unavailable)?;
        let index = db.open_tree(INDEX_TREE).map_err(unavailable)?;
        let statuses = db.open_tree(STATUS_TREE).map_err(unavailable)?;
        log::info!("Opened sled transfer store at {}", path);
        Ok(Self {
            db,
            queue,
            index,
            statuses,
            max_retries: DEFAULT_MAX_RETRIES,
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run `op`, retrying `Unavailable` failures with a delay of
    /// `min(attempt * 50ms, 2s)`
    async fn with_retry<T>(
        &self,
        name: &str,
        op: impl Fn() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(StoreError::Closed);
            }
            match op() {
                Err(StoreError::Unavailable(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = (attempt as u64 * RETRY_STEP_MS).min(RETRY_CAP_MS);
                    log::warn!(
                        "Store operation {} failed (attempt {}), retrying in {}ms: {}",
                        name,
                        attempt,
                        delay,
                        msg
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                result => return result,
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(tree: &str, key: &[u8], value: &[u8]) -> Option<T> {
        match serde_json::from_slice(value) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!(
                    "Skipping corrupt entry in {} ({}): {}",
                    tree,
                    String::from_utf8_lossy(key),
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl TransferStore for SledTransferStore {
    async fn enqueue(&self, transfer: &QueuedTransfer) -> Result<(), StoreError> {
        let value = serde_json::to_vec(transfer)?;
        let id = transfer.id.as_str().as_bytes();

        self.with_retry("enqueue", || {
            let seq = self.db.generate_id().map_err(unavailable)?.to_be_bytes();
            (&self.queue, &self.index)
                .transaction(|(queue, index)| -> TxResult<()> {
                    if let Some(old) = index.get(id)? {
                        queue.remove(old)?;
                    }
                    queue.insert(&seq[..], value.as_slice())?;
                    index.insert(id, &seq[..])?;
                    Ok(())
                })
                .map_err(tx_error)
        })
        .await?;

        // Accepted transfers must survive a crash
        self.db.flush_async().await.map_err(unavailable)?;
        Ok(())
    }

    async fn dequeue_front(&self, count: usize) -> Result<Vec<QueuedTransfer>, StoreError> {
        self.with_retry("dequeue_front", || {
            let mut front = Vec::with_capacity(count);
            for entry in self.queue.iter().take(count) {
                let (seq, value) = entry.map_err(unavailable)?;
                front.push((seq, value));
            }

            (&self.queue, &self.index)
                .transaction(|(queue, index)| -> TxResult<()> {
                    for (seq, value) in &front {
                        queue.remove(&seq[..])?;
                        if let Ok(t) = serde_json::from_slice::<QueuedTransfer>(value) {
                            index.remove(t.id.as_str().as_bytes())?;
                        }
                    }
                    Ok(())
                })
                .map_err(tx_error)?;

            Ok(front
                .iter()
                .filter_map(|(seq, value)| Self::decode(QUEUE_TREE, seq, value))
                .collect())
        })
        .await
    }

    async fn remove_queued(&self, ids: &[TransferId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_retry("remove_queued", || {
            (&self.queue, &self.index)
                .transaction(|(queue, index)| -> TxResult<usize> {
                    let mut removed = 0;
                    for id in ids {
                        if let Some(seq) = index.remove(id.as_str().as_bytes())? {
                            queue.remove(seq)?;
                            removed += 1;
                        }
                    }
                    Ok(removed)
                })
                .map_err(tx_error)
        })
        .await
    }

    async fn queue_length(&self) -> Result<usize, StoreError> {
        self.with_retry("queue_length", || Ok(self.queue.len())).await
    }

    async fn set_status(&self, status: &TransferStatus) -> Result<(), StoreError> {
        let value = serde_json::to_vec(status)?;
        self.with_retry("set_status", || {
            self.statuses
                .insert(status.transfer_id.as_str().as_bytes(), value.as_slice())
                .map(|_| ())
                .map_err(unavailable)
        })
        .await
    }

    async fn get_status(&self, id: &TransferId) -> Result<Option<TransferStatus>, StoreError> {
        let raw = self
            .with_retry("get_status", || {
                self.statuses.get(id.as_str().as_bytes()).map_err(unavailable)
            })
            .await?;
        match raw {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn delete_status(&self, id: &TransferId) -> Result<bool, StoreError> {
        self.with_retry("delete_status", || {
            self.statuses
                .remove(id.as_str().as_bytes())
                .map(|old| old.is_some())
                .map_err(unavailable)
        })
        .await
    }

    async fn all_statuses(&self) -> Result<HashMap<TransferId, TransferStatus>, StoreError> {
        self.with_retry("all_statuses", || {
            let mut statuses = HashMap::new();
            for entry in self.statuses.iter() {
                let (key, value) = entry.map_err(unavailable)?;
                if let Some(status) = Self::decode::<TransferStatus>(STATUS_TREE, &key, &value) {
                    statuses.insert(status.transfer_id.clone(), status);
                }
            }
            Ok(statuses)
        })
        .await
    }

    async fn recover_queue(&self) -> Result<Vec<QueuedTransfer>, StoreError> {
        self.with_retry("recover_queue", || {
            let mut transfers = Vec::new();
            for entry in self.queue.iter() {
                let (seq, value) = entry.map_err(unavailable)?;
                if let Some(transfer) = Self::decode(QUEUE_TREE, &seq, &value) {
                    transfers.push(transfer);
                }
            }
            Ok(transfers)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.db.size_on_disk().is_ok()
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.flush_async().await.map_err(unavailable)?;
        log::info!("Sled transfer store closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "sled"
    }
}
