//! Mock chain for testing and simulated runs
//!
//! Allows scripting submission failures and latency, and records every
//! `(public key, nonce)` pair it was asked to sign with.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::traits::{ChainRpc, SequenceProvider};
use crate::transfer::error::ChainError;
use crate::transfer::slots::SigningSlot;
use crate::transfer::types::{SubmitOutcome, TransferAction};

/// One submission seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub public_key: String,
    pub nonce: u64,
    pub receivers: Vec<String>,
    pub transaction_hash: Option<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockChain {
    name: String,
    latency: Duration,
    default_nonce: u64,
    /// Starting nonce per public key
    nonces: Mutex<HashMap<String, u64>>,
    /// Errors returned by the next submissions, in order
    scripted_failures: Mutex<VecDeque<String>>,
    fail_all: AtomicBool,
    submissions: Mutex<Vec<Submission>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hash_counter: AtomicU64,
}

impl MockChain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
            default_nonce: 0,
            nonces: Mutex::new(HashMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            fail_all: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            hash_counter: AtomicU64::new(0),
        }
    }

    /// Delay every submission by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Starting nonce reported for keys without an explicit entry
    pub fn with_default_nonce(mut self, nonce: u64) -> Self {
        self.default_nonce = nonce;
        self
    }

    pub fn set_starting_nonce(&self, public_key: &str, nonce: u64) {
        lock(&self.nonces).insert(public_key.to_string(), nonce);
    }

    /// Fail the next `count` submissions with `error`
    pub fn fail_next(&self, count: usize, error: &str) {
        let mut failures = lock(&self.scripted_failures);
        for _ in 0..count {
            failures.push_back(error.to_string());
        }
    }

    /// Fail every submission until turned off again
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    pub fn submission_count(&self) -> usize {
        lock(&self.submissions).len()
    }

    /// Highest number of submissions that were in progress at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<String> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Some("simulated chain failure".to_string());
        }
        lock(&self.scripted_failures).pop_front()
    }
}

#[async_trait]
impl SequenceProvider for MockChain {
    async fn query_starting_sequence(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<u64, ChainError> {
        let nonce = lock(&self.nonces)
            .get(public_key)
            .copied()
            .unwrap_or(self.default_nonce);
        log::debug!("[{}] view_access_key({}, {}) = {}", self.name, account_id, public_key, nonce);
        Ok(nonce)
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn submit(
        &self,
        account_id: &str,
        contract_id: &str,
        actions: &[TransferAction],
        slot: &SigningSlot,
    ) -> Result<SubmitOutcome, ChainError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        log::debug!(
            "[{}] submit({} -> {}, {} actions, nonce={})",
            self.name,
            account_id,
            contract_id,
            actions.len(),
            slot.submit_nonce()
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match self.next_failure() {
            Some(error) => Err(ChainError::Rpc(error)),
            None => {
                let n = self.hash_counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(SubmitOutcome {
                    transaction_hash: format!("mock{:016x}", n),
                })
            }
        };
        lock(&self.submissions).push(Submission {
            public_key: slot.public_key().to_string(),
            nonce: slot.submit_nonce(),
            receivers: actions.iter().map(|a| a.receiver_id.clone()).collect(),
            transaction_hash: result.as_ref().ok().map(|o| o.transaction_hash.clone()),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}
