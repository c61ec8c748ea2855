//! Core types for the batching engine
//!
//! This module defines the fundamental types shared by the queue, dispatcher
//! and ledger.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::common_utils::{generate_batch_id, generate_transfer_id};
use crate::transfer::state::TransferState;

/// Method invoked on the token contract for every action
pub const FT_TRANSFER_METHOD: &str = "ft_transfer";

/// Transfer identifier - `tx_<ms>_<16 hex>`
///
/// Permanent for the life of a logical transfer request, retries included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(generate_transfer_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TransferId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Request to transfer tokens to a receiver (pre-validated by the caller)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Receiving account
    pub receiver_id: String,
    /// Amount in the token's smallest unit, as a decimal string
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl TransferRequest {
    pub fn new(receiver_id: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            amount: amount.into(),
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// A transfer waiting in (or handed out from) the ingestion queue
///
/// This is also the record kept in the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTransfer {
    pub id: TransferId,
    #[serde(flatten)]
    pub request: TransferRequest,
    /// Enqueue time (ms); refreshed on every retry
    pub timestamp: i64,
    /// Number of failed attempts so far
    pub retries: u32,
}

impl QueuedTransfer {
    pub fn new(request: TransferRequest, now_ms: i64) -> Self {
        Self {
            id: TransferId::generate(),
            request,
            timestamp: now_ms,
            retries: 0,
        }
    }

    /// Copy for the next attempt: same identifier, counter + 1, fresh timestamp
    pub fn next_attempt(&self, now_ms: i64) -> Self {
        Self {
            id: self.id.clone(),
            request: self.request.clone(),
            timestamp: now_ms,
            retries: self.retries + 1,
        }
    }
}

/// Externally observable status of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub transfer_id: TransferId,
    #[serde(rename = "status")]
    pub state: TransferState,
    pub receiver_id: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub retries: u32,
}

impl TransferStatus {
    pub fn queued(transfer: &QueuedTransfer) -> Self {
        Self {
            transfer_id: transfer.id.clone(),
            state: TransferState::Queued,
            receiver_id: transfer.request.receiver_id.clone(),
            amount: transfer.request.amount.clone(),
            memo: transfer.request.memo.clone(),
            transaction_hash: None,
            error: None,
            queued_at: transfer.timestamp,
            processing_at: None,
            completed_at: None,
            latency_ms: None,
            retries: transfer.retries,
        }
    }

    /// Rebuild the queue record for a status (used when reconciling a queue
    /// entry that lost its status, or vice versa)
    pub fn to_queued_transfer(&self) -> QueuedTransfer {
        QueuedTransfer {
            id: self.transfer_id.clone(),
            request: TransferRequest {
                receiver_id: self.receiver_id.clone(),
                amount: self.amount.clone(),
                memo: self.memo.clone(),
            },
            timestamp: self.queued_at,
            retries: self.retries,
        }
    }
}

/// A group of transfers submitted as one multi-action transaction
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    /// Submission order of the actions
    pub transfers: Vec<QueuedTransfer>,
    pub created_at: i64,
}

impl Batch {
    pub fn new(transfers: Vec<QueuedTransfer>, now_ms: i64) -> Self {
        Self {
            id: generate_batch_id(),
            transfers,
            created_at: now_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn ids(&self) -> Vec<TransferId> {
        self.transfers.iter().map(|t| t.id.clone()).collect()
    }
}

/// Fixed resource budget attached to every action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionBudget {
    /// Gas per action
    pub gas: u64,
    /// Attached deposit per action (yocto units)
    pub deposit: u128,
}

impl Default for ActionBudget {
    fn default() -> Self {
        Self {
            gas: 30_000_000_000_000, // 30 TGas
            deposit: 1,              // 1 yocto, required by ft_transfer
        }
    }
}

/// One `ft_transfer` call inside a batch transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAction {
    pub receiver_id: String,
    pub amount: String,
    pub memo: Option<String>,
    pub gas: u64,
    pub deposit: u128,
}

impl TransferAction {
    pub fn for_transfer(transfer: &QueuedTransfer, budget: ActionBudget) -> Self {
        Self {
            receiver_id: transfer.request.receiver_id.clone(),
            amount: transfer.request.amount.clone(),
            memo: transfer.request.memo.clone(),
            gas: budget.gas,
            deposit: budget.deposit,
        }
    }

    pub fn method_name(&self) -> &'static str {
        FT_TRANSFER_METHOD
    }

    /// JSON arguments of the contract call
    pub fn args(&self) -> serde_json::Value {
        serde_json::json!({
            "receiver_id": self.receiver_id,
            "amount": self.amount,
            "memo": self.memo,
        })
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub transaction_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> QueuedTransfer {
        QueuedTransfer::new(TransferRequest::new("alice.testnet", "1000").with_memo("hi"), 1_000)
    }

    #[test]
    fn test_queued_transfer_json_shape() {
        let transfer = queued();
        let json = serde_json::to_value(&transfer).unwrap();

        // Flattened request fields, same shape as the durable queue record
        assert_eq!(json["receiver_id"], "alice.testnet");
        assert_eq!(json["amount"], "1000");
        assert_eq!(json["memo"], "hi");
        assert_eq!(json["timestamp"], 1_000);
        assert_eq!(json["retries"], 0);
        assert_eq!(json["id"], transfer.id.as_str());

        let parsed: QueuedTransfer = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, transfer);
    }

    #[test]
    fn test_next_attempt_keeps_identifier() {
        let transfer = queued();
        let retry = transfer.next_attempt(5_000);
        assert_eq!(retry.id, transfer.id);
        assert_eq!(retry.retries, 1);
        assert_eq!(retry.timestamp, 5_000);
        assert_eq!(retry.request, transfer.request);
    }

    #[test]
    fn test_status_serializes_state_as_status() {
        let status = TransferStatus::queued(&queued());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("transaction_hash").is_none());
        assert!(json.get("latency_ms").is_none());
    }

    #[test]
    fn test_status_roundtrip_to_queue_record() {
        let transfer = queued();
        let status = TransferStatus::queued(&transfer);
        assert_eq!(status.to_queued_transfer(), transfer);
    }

    #[test]
    fn test_action_args() {
        let transfer = QueuedTransfer::new(TransferRequest::new("bob.testnet", "42"), 0);
        let action = TransferAction::for_transfer(&transfer, ActionBudget::default());
        assert_eq!(action.method_name(), "ft_transfer");
        assert_eq!(action.gas, 30_000_000_000_000);
        assert_eq!(action.deposit, 1);

        let args = action.args();
        assert_eq!(args["receiver_id"], "bob.testnet");
        assert_eq!(args["amount"], "42");
        assert!(args["memo"].is_null());
    }

    #[test]
    fn test_transfer_id_borrow() {
        let mut map = std::collections::HashMap::new();
        map.insert(TransferId::new("tx_1_a"), 1);
        assert_eq!(map.get("tx_1_a"), Some(&1));
    }
}
