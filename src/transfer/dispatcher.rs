//! Batch Dispatcher
//!
//! Executes batches cut by the ingestion queue with bounded concurrency:
//!
//! 1. mark every member Processing
//! 2. lease a signing slot (bounded wait)
//! 3. build one `ft_transfer` action per member and submit, under a timeout
//! 4. release the slot
//! 5. on success confirm every member with the shared transaction hash, on
//!    failure fail every member and hand each one to the retry policy
//!
//! Batches beyond `max_concurrent_batches` wait in the channel until a running
//! batch finishes.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::common_utils::get_current_timestamp_ms;
use crate::event_log::{EventLevel, EventLog};
use crate::transfer::adapters::ChainRpc;
use crate::transfer::error::{ChainError, ServiceError};
use crate::transfer::ledger::TransferLedger;
use crate::transfer::queue::IngestionQueue;
use crate::transfer::retry::{RetryDecision, RetryPolicy};
use crate::transfer::slots::SlotPool;
use crate::transfer::state::TransferEvent;
use crate::transfer::throughput::ThroughputTracker;
use crate::transfer::types::{ActionBudget, Batch, QueuedTransfer, SubmitOutcome, TransferAction, TransferId};

const COMPONENT: &str = "dispatcher";

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Signer of every batch transaction
    pub account_id: String,
    /// Token contract receiving the actions
    pub contract_id: String,
    pub budget: ActionBudget,
    pub submit_timeout: Duration,
    pub max_concurrent_batches: usize,
    pub retry: RetryPolicy,
}

pub struct Dispatcher {
    settings: DispatchSettings,
    chain: Arc<dyn ChainRpc>,
    slots: Arc<SlotPool>,
    queue: Arc<IngestionQueue>,
    ledger: Arc<TransferLedger>,
    throughput: Arc<ThroughputTracker>,
    events: Arc<EventLog>,
    permits: Arc<Semaphore>,
}

/// Stops a running dispatcher
pub struct DispatcherHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop taking new batches, run the ones already handed over, and wait
    /// until every in-flight batch has finished
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            log::error!("Dispatcher task failed: {}", e);
        }
    }
}

impl Dispatcher {
    pub fn new(
        settings: DispatchSettings,
        chain: Arc<dyn ChainRpc>,
        slots: Arc<SlotPool>,
        queue: Arc<IngestionQueue>,
        ledger: Arc<TransferLedger>,
        throughput: Arc<ThroughputTracker>,
        events: Arc<EventLog>,
    ) -> Self {
        let max = settings.max_concurrent_batches.max(1);
        Self {
            settings,
            chain,
            slots,
            queue,
            ledger,
            throughput,
            events,
            permits: Arc::new(Semaphore::new(max)),
        }
    }

    pub fn max_concurrent_batches(&self) -> usize {
        self.settings.max_concurrent_batches.max(1)
    }

    /// Batches currently being executed
    pub fn active_batches(&self) -> usize {
        self.max_concurrent_batches() - self.permits.available_permits()
    }

    /// Start consuming batches in a background task
    pub fn spawn(self: Arc<Self>, batches: mpsc::UnboundedReceiver<Batch>) -> DispatcherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(batches, stop_rx));
        DispatcherHandle { stop_tx, join }
    }

    async fn run(self: Arc<Self>, mut batches: mpsc::UnboundedReceiver<Batch>, mut stop_rx: watch::Receiver<bool>) {
        log::info!(
            "Dispatcher started (max_concurrent_batches={}, chain={})",
            self.max_concurrent_batches(),
            self.chain.name()
        );

        loop {
            tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => self.clone().launch(batch).await,
                    None => break,
                },
                _ = stop_rx.changed() => break,
            }
        }

        // Batches already cut are executed rather than abandoned
        batches.close();
        let mut drained = 0usize;
        while let Some(batch) = batches.recv().await {
            drained += 1;
            self.clone().launch(batch).await;
        }
        if drained > 0 {
            log::info!("Dispatched {} buffered batches during shutdown", drained);
        }

        let max = self.max_concurrent_batches() as u32;
        match self.permits.acquire_many(max).await {
            Ok(_all) => log::info!("Dispatcher stopped, no batches in flight"),
            Err(e) => log::error!("Dispatcher stopped without draining: {}", e),
        }
    }

    /// Wait for a concurrency permit, then run the batch in its own task
    async fn launch(self: Arc<Self>, batch: Batch) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                log::error!("Dropping batch {}: {}", batch.id, e);
                return;
            }
        };
        tokio::spawn(async move {
            let _permit = permit;
            self.process_batch(batch).await;
        });
    }

    pub async fn process_batch(&self, batch: Batch) {
        let started = Instant::now();
        let dispatch_at = get_current_timestamp_ms();

        let mut transfers = Vec::with_capacity(batch.len());
        for transfer in batch.transfers {
            match self.ledger.apply(&transfer.id, TransferEvent::Dispatch, dispatch_at).await {
                Ok(_) => transfers.push(transfer),
                Err(e) => log::warn!("Skipping {} in batch {}: {}", transfer.id, batch.id, e),
            }
        }
        if transfers.is_empty() {
            return;
        }

        log::info!("Processing batch {} with {} transfers", batch.id, transfers.len());

        match self.submit(&transfers).await {
            Ok(outcome) => self.complete(&batch.id, transfers, outcome, started).await,
            Err(e) => self.fail(&batch.id, transfers, e.to_string()).await,
        }
    }

    async fn submit(&self, transfers: &[QueuedTransfer]) -> Result<SubmitOutcome, ServiceError> {
        let slot = self.slots.allocate().await?;
        let actions: Vec<TransferAction> = transfers
            .iter()
            .map(|t| TransferAction::for_transfer(t, self.settings.budget))
            .collect();

        log::debug!(
            "Submitting {} actions with slot {} at nonce {}",
            actions.len(),
            slot.index(),
            slot.submit_nonce()
        );
        let result = tokio::time::timeout(
            self.settings.submit_timeout,
            self.chain.submit(&self.settings.account_id, &self.settings.contract_id, &actions, &slot),
        )
        .await;
        self.slots.release(slot);

        match result {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(ChainError::Timeout(self.settings.submit_timeout).into()),
        }
    }

    async fn complete(&self, batch_id: &str, transfers: Vec<QueuedTransfer>, outcome: SubmitOutcome, started: Instant) {
        let now = get_current_timestamp_ms();
        let ids: Vec<TransferId> = transfers.iter().map(|t| t.id.clone()).collect();

        for id in &ids {
            let event = TransferEvent::Confirm {
                tx_hash: outcome.transaction_hash.clone(),
            };
            match self.ledger.apply(id, event, now).await {
                Ok(_) => self.throughput.record_completion(now),
                Err(e) => log::warn!("Failed to confirm {}: {}", id, e),
            }
        }
        self.queue.acknowledge(&ids).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.events.component(
            COMPONENT,
            EventLevel::Info,
            format!("Batch {} completed: {} transfers in {}ms", batch_id, ids.len(), duration_ms),
            Some(json!({
                "batchId": batch_id,
                "transactionHash": outcome.transaction_hash,
                "size": ids.len(),
                "durationMs": duration_ms,
            })),
        );
    }

    async fn fail(&self, batch_id: &str, transfers: Vec<QueuedTransfer>, error: String) {
        let now = get_current_timestamp_ms();
        self.events.component(
            COMPONENT,
            EventLevel::Error,
            format!("Batch {} failed: {}", batch_id, error),
            Some(json!({ "batchId": batch_id, "size": transfers.len() })),
        );

        let mut exhausted = Vec::new();
        for transfer in transfers {
            let event = TransferEvent::Fail { error: error.clone() };
            if let Err(e) = self.ledger.apply(&transfer.id, event, now).await {
                log::warn!("Failed to record failure of {}: {}", transfer.id, e);
                continue;
            }
            match self.settings.retry.evaluate(&transfer, now) {
                RetryDecision::Requeue(next) => {
                    if let Err(e) = self.queue.requeue(next).await {
                        log::error!("Failed to re-queue {}: {}", transfer.id, e);
                    }
                }
                RetryDecision::Exhausted => {
                    log::warn!(
                        "Transfer {} failed permanently after {} retries: {}",
                        transfer.id,
                        transfer.retries,
                        error
                    );
                    exhausted.push(transfer.id);
                }
            }
        }
        self.queue.acknowledge(&exhausted).await;
    }
}
