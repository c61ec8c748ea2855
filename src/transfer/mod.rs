//! Transfer module - FT transfer batching engine
//!
//! Requests are queued, cut into batches, and each batch is submitted as one
//! multi-action transaction signed through a pool of signing slots. Status of
//! every transfer is tracked in a write-through ledger.

pub mod adapters;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod slots;
pub mod state;
pub mod stats;
pub mod throughput;
pub mod types;

// Re-export commonly used types
pub use error::{ChainError, LedgerError, ServiceError, SlotError, StoreError};
pub use service::{EngineConfig, RecoveryReport, TransferService};
pub use scheduler::BatchScheduler;
pub use slots::{SlotKey, SlotPoolStats};
pub use state::{TransferEvent, TransferState};
pub use stats::{BenchmarkInfo, ServiceStats};
pub use types::{ActionBudget, QueuedTransfer, TransferId, TransferRequest, TransferStatus};
