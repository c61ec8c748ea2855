//! Transfer Service
//!
//! Wires the batching engine together: recovers persisted state, owns the
//! queue, scheduler, dispatcher and slot pool, and exposes the operations the
//! API layer calls.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::common_utils::{get_current_iso_timestamp, get_current_timestamp_ms};
use crate::event_log::{EventLevel, EventLog};
use crate::transfer::adapters::{ChainRpc, TransferStore};
use crate::transfer::dispatcher::{DispatchSettings, Dispatcher, DispatcherHandle};
use crate::transfer::error::ServiceError;
use crate::transfer::ledger::TransferLedger;
use crate::transfer::queue::IngestionQueue;
use crate::transfer::retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::transfer::scheduler::BatchScheduler;
use crate::transfer::slots::{SlotKey, SlotPool, SlotPoolStats};
use crate::transfer::state::{TransferEvent, TransferState};
use crate::transfer::stats::{BenchmarkInfo, ServiceStats, TransferCounters};
use crate::transfer::throughput::ThroughputTracker;
use crate::transfer::types::{ActionBudget, QueuedTransfer, TransferId, TransferRequest, TransferStatus};

const COMPONENT: &str = "transfer_service";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Signer account
    pub account_id: String,
    /// Token contract
    pub contract_id: String,
    /// Keys backing the signing slots, assigned round-robin
    pub keys: Vec<SlotKey>,
    /// Number of signing slots
    pub slot_count: usize,
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub batch_interval: Duration,
    pub throughput_window_ms: i64,
    pub submit_timeout: Duration,
    pub slot_acquire_timeout: Duration,
    pub budget: ActionBudget,
    pub max_retries: u32,
    pub benchmark: BenchmarkInfo,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            contract_id: String::new(),
            keys: Vec::new(),
            slot_count: 10,
            max_batch_size: 100,
            max_concurrent_batches: 10,
            batch_interval: Duration::from_millis(100),
            throughput_window_ms: 60_000,
            submit_timeout: Duration::from_secs(30),
            slot_acquire_timeout: Duration::from_secs(5),
            budget: ActionBudget::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            benchmark: BenchmarkInfo::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut problems = Vec::new();
        if self.account_id.is_empty() {
            problems.push("account_id is empty");
        }
        if self.contract_id.is_empty() {
            problems.push("contract_id is empty");
        }
        if self.keys.is_empty() {
            problems.push("no signing keys");
        }
        if self.slot_count == 0 {
            problems.push("slot_count must be > 0");
        }
        if self.max_batch_size == 0 {
            problems.push("max_batch_size must be > 0");
        }
        if self.max_concurrent_batches == 0 {
            problems.push("max_concurrent_batches must be > 0");
        }
        if self.batch_interval.is_zero() {
            problems.push("batch_interval must be > 0");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Config(problems.join(", ")))
        }
    }
}

/// Outcome of startup reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub statuses: usize,
    pub queued: usize,
    pub stale_removed: usize,
    pub statuses_recreated: usize,
    pub processing_reset: usize,
    pub failed_requeued: usize,
    pub retries_resumed: usize,
    pub orphans_requeued: usize,
    pub replayed_completions: usize,
}

pub struct TransferService {
    config: EngineConfig,
    store: Arc<dyn TransferStore>,
    ledger: Arc<TransferLedger>,
    queue: Arc<IngestionQueue>,
    slots: Arc<SlotPool>,
    dispatcher: Arc<Dispatcher>,
    scheduler: BatchScheduler,
    throughput: Arc<ThroughputTracker>,
    events: Arc<EventLog>,
    dispatcher_handle: Mutex<Option<DispatcherHandle>>,
    recovery: RecoveryReport,
}

impl TransferService {
    /// Build the engine, recover persisted state and start processing.
    ///
    /// Fails if the slot pool cannot query its starting sequence or the
    /// store cannot be read.
    pub async fn initialize(
        config: EngineConfig,
        chain: Arc<dyn ChainRpc>,
        store: Arc<dyn TransferStore>,
        scheduler: BatchScheduler,
        events: Arc<EventLog>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        events.component(
            COMPONENT,
            EventLevel::Info,
            format!(
                "Initializing for {} on {} (chain={}, store={})",
                config.account_id,
                config.contract_id,
                chain.name(),
                store.name()
            ),
            None,
        );

        let slots = Arc::new(
            SlotPool::initialize(
                chain.as_ref(),
                &config.account_id,
                &config.keys,
                config.slot_count,
                config.slot_acquire_timeout,
            )
            .await?,
        );

        let ledger = Arc::new(TransferLedger::new(store.clone()));
        let throughput = Arc::new(ThroughputTracker::new(config.throughput_window_ms));
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(IngestionQueue::new(
            store.clone(),
            ledger.clone(),
            config.max_batch_size,
            batch_tx,
        ));
        let retry = RetryPolicy::new(config.max_retries);

        let recovery = recover(store.as_ref(), &ledger, &queue, &throughput, retry).await?;
        events.component(
            COMPONENT,
            EventLevel::Info,
            format!(
                "Recovered {} pending transfers and {} transfer statuses from persistence",
                recovery.queued, recovery.statuses
            ),
            Some(json!({
                "recoveredTransfers": recovery.queued,
                "recoveredStatuses": recovery.statuses,
                "staleRemoved": recovery.stale_removed,
                "failedRequeued": recovery.failed_requeued,
                "retriesResumed": recovery.retries_resumed,
                "orphansRequeued": recovery.orphans_requeued,
            })),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            DispatchSettings {
                account_id: config.account_id.clone(),
                contract_id: config.contract_id.clone(),
                budget: config.budget,
                submit_timeout: config.submit_timeout,
                max_concurrent_batches: config.max_concurrent_batches,
                retry,
            },
            chain,
            slots.clone(),
            queue.clone(),
            ledger.clone(),
            throughput.clone(),
            events.clone(),
        ));
        let handle = dispatcher.clone().spawn(batch_rx);
        scheduler.start(queue.clone());

        events.component(COMPONENT, EventLevel::Info, "Initialization complete", None);

        Ok(Self {
            config,
            store,
            ledger,
            queue,
            slots,
            dispatcher,
            scheduler,
            throughput,
            events,
            dispatcher_handle: Mutex::new(Some(handle)),
            recovery,
        })
    }

    /// Queue one transfer
    pub async fn enqueue(&self, request: TransferRequest) -> Result<TransferStatus, ServiceError> {
        self.queue.enqueue(request).await
    }

    /// Queue several transfers in order. Stops at the first failure; transfers
    /// queued before it stay queued.
    pub async fn enqueue_many(
        &self,
        requests: Vec<TransferRequest>,
    ) -> Result<Vec<TransferStatus>, ServiceError> {
        let mut queued = Vec::with_capacity(requests.len());
        for request in requests {
            queued.push(self.queue.enqueue(request).await?);
        }
        Ok(queued)
    }

    pub fn status(&self, id: &str) -> Option<TransferStatus> {
        self.ledger.get(id)
    }

    pub fn stats(&self) -> ServiceStats {
        let mut counters = self.ledger.with_statuses(TransferCounters::from_statuses);
        counters.throughput = self.throughput.throughput(get_current_timestamp_ms());
        counters.queue_size = self.queue.len();
        counters.active_batches = self.dispatcher.active_batches();

        ServiceStats {
            stats: counters,
            slot_pool: self.slots.stats(),
            benchmark: self.config.benchmark,
            timestamp: get_current_iso_timestamp(),
        }
    }

    pub fn slot_stats(&self) -> SlotPoolStats {
        self.slots.stats()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub async fn health(&self) -> bool {
        self.store.health_check().await
    }

    pub fn is_accepting(&self) -> bool {
        self.queue.is_accepting()
    }

    /// Delete terminal statuses completed before `cutoff_ms`. Returns how many
    /// were removed.
    pub async fn prune_terminal(&self, cutoff_ms: i64) -> Result<usize, ServiceError> {
        let expired: Vec<TransferId> = self.ledger.with_statuses(|statuses| {
            statuses
                .values()
                .filter(|s| s.state.is_terminal())
                .filter(|s| s.completed_at.unwrap_or(s.queued_at) < cutoff_ms)
                .map(|s| s.transfer_id.clone())
                .collect()
        });

        let mut removed = 0;
        for id in &expired {
            if self.ledger.remove(id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.events.component(
                COMPONENT,
                EventLevel::Info,
                format!("Pruned {} terminal transfer statuses", removed),
                Some(json!({ "removed": removed, "cutoff": cutoff_ms })),
            );
        }
        Ok(removed)
    }

    /// Stop the scheduler, refuse new requests, wait for in-flight batches and
    /// close the store. Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(handle) = self.dispatcher_handle.lock().await.take() else {
            return;
        };
        self.events.component(COMPONENT, EventLevel::Info, "Shutting down...", None);

        self.scheduler.stop().await;
        self.queue.close();
        handle.shutdown().await;

        if let Err(e) = self.store.close().await {
            log::error!("Failed to close {} store: {}", self.store.name(), e);
        }
        self.events.component(COMPONENT, EventLevel::Info, "Shutdown complete", None);
    }
}

/// Rehydrate the ledger and queue from the store and repair anything a crash
/// between the queue write and the status write left inconsistent
async fn recover(
    store: &dyn TransferStore,
    ledger: &TransferLedger,
    queue: &IngestionQueue,
    throughput: &ThroughputTracker,
    retry: RetryPolicy,
) -> Result<RecoveryReport, ServiceError> {
    let now = get_current_timestamp_ms();
    let statuses = store.all_statuses().await?;
    let entries = store.recover_queue().await?;

    let mut report = RecoveryReport {
        statuses: statuses.len(),
        ..Default::default()
    };
    ledger.rehydrate(statuses);

    let mut restored: Vec<QueuedTransfer> = Vec::with_capacity(entries.len());
    let mut retried: Vec<QueuedTransfer> = Vec::new();
    let mut stale: Vec<TransferId> = Vec::new();
    let mut in_queue: HashSet<TransferId> = HashSet::with_capacity(entries.len());

    for entry in entries {
        in_queue.insert(entry.id.clone());
        let Some(status) = ledger.get(entry.id.as_str()) else {
            ledger.insert(TransferStatus::queued(&entry)).await?;
            report.statuses_recreated += 1;
            restored.push(entry);
            continue;
        };

        match status.state {
            TransferState::Queued => restored.push(entry),
            TransferState::Processing => {
                ledger.apply(&entry.id, TransferEvent::Recover, now).await?;
                report.processing_reset += 1;
                restored.push(entry);
            }
            TransferState::Confirmed => stale.push(entry.id),
            // Next attempt was written before the crash but its status was not
            TransferState::Failed if entry.retries > status.retries => {
                let event = TransferEvent::Requeue { retries: entry.retries };
                ledger.apply(&entry.id, event, entry.timestamp).await?;
                report.retries_resumed += 1;
                restored.push(entry);
            }
            TransferState::Failed => match retry.evaluate(&entry, now) {
                RetryDecision::Requeue(next) => {
                    store.enqueue(&next).await?;
                    let event = TransferEvent::Requeue { retries: next.retries };
                    ledger.apply(&next.id, event, next.timestamp).await?;
                    report.failed_requeued += 1;
                    retried.push(next);
                }
                RetryDecision::Exhausted => stale.push(entry.id),
            },
        }
    }

    if !stale.is_empty() {
        report.stale_removed = store.remove_queued(&stale).await?;
    }

    // Accepted transfers whose queue entry never made it to the store
    let mut orphans: Vec<TransferStatus> = ledger.with_statuses(|statuses| {
        statuses
            .values()
            .filter(|s| s.state.is_pending() && !in_queue.contains(&s.transfer_id))
            .cloned()
            .collect()
    });
    orphans.sort_by_key(|s| s.queued_at);
    for orphan in orphans {
        if orphan.state == TransferState::Processing {
            ledger.apply(&orphan.transfer_id, TransferEvent::Recover, now).await?;
            report.processing_reset += 1;
        }
        let entry = orphan.to_queued_transfer();
        store.enqueue(&entry).await?;
        report.orphans_requeued += 1;
        retried.push(entry);
    }

    let completions: Vec<i64> = ledger.with_statuses(|statuses| {
        statuses
            .values()
            .filter(|s| s.state == TransferState::Confirmed)
            .filter_map(|s| s.completed_at)
            .collect()
    });
    report.replayed_completions = completions.len();
    for completed_at in completions {
        throughput.record_completion(completed_at);
    }

    restored.extend(retried);
    report.queued = restored.len();
    queue.restore(restored);

    Ok(report)
}
