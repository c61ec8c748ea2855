//! Aggregate statistics

use serde::Serialize;
use std::collections::HashMap;

use crate::transfer::slots::SlotPoolStats;
use crate::transfer::state::TransferState;
use crate::transfer::types::{TransferId, TransferStatus};

/// Benchmark parameters echoed back for load-test tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkInfo {
    pub target_transfers: u64,
    pub concurrent_requests: u32,
    pub duration_seconds: u64,
}

impl Default for BenchmarkInfo {
    fn default() -> Self {
        Self {
            target_transfers: 60_000,
            concurrent_requests: 10,
            duration_seconds: 600,
        }
    }
}

/// Counters derived from the ledger plus queue/rate figures
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCounters {
    pub total_transfers: usize,
    pub successful_transfers: usize,
    pub failed_transfers: usize,
    /// Percentage of all known transfers that are Confirmed
    pub success_rate: f64,
    /// Transfers per second over the throughput window
    pub throughput: f64,
    pub queue_size: usize,
    pub pending_transfers: usize,
    pub processing_transfers: usize,
    /// Mean latency of Confirmed transfers (ms)
    pub average_processing_time: f64,
    pub active_batches: usize,
}

impl TransferCounters {
    /// Tally the ledger. `throughput`, `queue_size` and `active_batches` are
    /// filled in by the caller.
    pub fn from_statuses(statuses: &HashMap<TransferId, TransferStatus>) -> Self {
        let mut successful = 0;
        let mut failed = 0;
        let mut pending = 0;
        let mut processing = 0;
        let mut latency_sum = 0i64;
        let mut latency_count = 0usize;

        for status in statuses.values() {
            match status.state {
                TransferState::Confirmed => {
                    successful += 1;
                    if let Some(latency) = status.latency_ms {
                        latency_sum += latency;
                        latency_count += 1;
                    }
                }
                TransferState::Failed => failed += 1,
                TransferState::Processing => processing += 1,
                TransferState::Queued => pending += 1,
            }
        }

        let total = statuses.len();
        Self {
            total_transfers: total,
            successful_transfers: successful,
            failed_transfers: failed,
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            throughput: 0.0,
            queue_size: 0,
            pending_transfers: pending,
            processing_transfers: processing,
            average_processing_time: if latency_count > 0 {
                latency_sum as f64 / latency_count as f64
            } else {
                0.0
            },
            active_batches: 0,
        }
    }
}

/// Payload of the stats endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub stats: TransferCounters,
    pub slot_pool: SlotPoolStats,
    pub benchmark: BenchmarkInfo,
    /// RFC 3339 time the snapshot was taken
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::{QueuedTransfer, TransferRequest};

    fn status(state: TransferState, latency: Option<i64>) -> TransferStatus {
        let mut s = TransferStatus::queued(&QueuedTransfer::new(TransferRequest::new("a.testnet", "1"), 0));
        s.state = state;
        s.latency_ms = latency;
        s
    }

    #[test]
    fn test_counters() {
        let statuses: HashMap<TransferId, TransferStatus> = [
            status(TransferState::Confirmed, Some(100)),
            status(TransferState::Confirmed, Some(300)),
            status(TransferState::Failed, Some(50)),
            status(TransferState::Processing, None),
        ]
        .into_iter()
        .map(|s| (s.transfer_id.clone(), s))
        .collect();

        let counters = TransferCounters::from_statuses(&statuses);
        assert_eq!(counters.total_transfers, 4);
        assert_eq!(counters.successful_transfers, 2);
        assert_eq!(counters.failed_transfers, 1);
        assert_eq!(counters.processing_transfers, 1);
        assert_eq!(counters.pending_transfers, 0);
        assert!((counters.success_rate - 50.0).abs() < f64::EPSILON);
        assert!((counters.average_processing_time - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_counters() {
        let counters = TransferCounters::from_statuses(&HashMap::new());
        assert_eq!(counters.success_rate, 0.0);
        assert_eq!(counters.average_processing_time, 0.0);

        let json = serde_json::to_value(&counters).unwrap();
        assert!(json.get("totalTransfers").is_some());
        assert!(json.get("averageProcessingTime").is_some());
    }
}
