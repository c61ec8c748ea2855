//! Adapters module - durable store and chain collaborators

pub mod traits;
pub mod memory;
pub mod mock;
pub mod near_rpc;
pub mod sled_store;

pub use traits::{ChainRpc, SequenceProvider, TransferStore};

// In-process doubles (tests, simulated mode)
pub use memory::MemoryTransferStore;
pub use mock::MockChain;

// Production collaborators
pub use near_rpc::NearRpcClient;
pub use sled_store::SledTransferStore;
