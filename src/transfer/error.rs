//! Error types for the batching engine

use std::time::Duration;

use thiserror::Error;

use crate::transfer::state::TransferState;
use crate::transfer::types::TransferId;

/// Durable store failures (after the store's own retries are exhausted)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store is closed")]
    Closed,
}

/// Chain collaborator failures
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction serialization failed: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        ChainError::Transport(e.to_string())
    }
}

/// Signing-slot allocation failures
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("no signing slot became free within {0:?}")]
    Exhausted(Duration),
    #[error("signing slot pool has no slots")]
    EmptyPool,
    #[error("failed to query starting sequence: {0}")]
    Sequence(#[from] ChainError),
}

/// Ledger update failures
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transfer not found: {0}")]
    NotFound(TransferId),
    #[error("invalid transition for {id}: {event} in state {from}")]
    InvalidTransition {
        id: TransferId,
        from: TransferState,
        event: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the service facade
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("invalid engine configuration: {0}")]
    Config(String),
}
