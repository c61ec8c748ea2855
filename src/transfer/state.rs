//! Transfer State Machine
//!
//! Defines the lifecycle states, events, and transition function for a single
//! transfer identifier:
//!
//! ```text
//! Queued ──Dispatch──► Processing ──Confirm──► Confirmed
//!   ▲                     │  │
//!   │                     │  └────Fail────► Failed
//!   └──────Recover────────┘                   │
//!   ▲                                         │
//!   └──────────────Requeue (retries < max)────┘
//! ```

use serde::{Deserialize, Serialize};

/// Transfer lifecycle states
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferState {
    /// Waiting in the ingestion queue
    Queued,
    /// Part of a batch that is being submitted
    Processing,
    /// Included in a successfully submitted transaction
    Confirmed,
    /// Batch submission failed (may be re-queued by the retry policy)
    Failed,
}

impl TransferState {
    /// Confirmed and Failed end a dispatch attempt. Whether a Failed transfer
    /// is really final depends on its retry counter, which the ledger does not
    /// own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Confirmed | TransferState::Failed)
    }

    /// Still waiting for a batch outcome
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Batch picked up by the dispatcher
    Dispatch,
    /// Transaction accepted by the chain
    Confirm { tx_hash: String },
    /// Batch submission failed
    Fail { error: String },
    /// Retry policy put the transfer back on the queue as attempt `retries`
    Requeue { retries: u32 },
    /// Restart found the transfer mid-flight; it goes back to the queue
    Recover,
}

impl TransferEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::Dispatch => "dispatch",
            TransferEvent::Confirm { .. } => "confirm",
            TransferEvent::Fail { .. } => "fail",
            TransferEvent::Requeue { .. } => "requeue",
            TransferEvent::Recover => "recover",
        }
    }
}

/// State transition function
///
/// Returns `None` when the event is not valid in the current state.
pub fn transition(current: TransferState, event: &TransferEvent) -> Option<TransferState> {
    use TransferEvent::*;
    use TransferState::*;

    match (current, event) {
        (Queued, Dispatch) => Some(Processing),
        (Processing, Confirm { .. }) => Some(Confirmed),
        (Processing, Fail { .. }) => Some(Failed),
        (Processing, Recover) => Some(Queued),
        (Failed, Requeue { .. }) => Some(Queued),
        _ => None,
    }
}
