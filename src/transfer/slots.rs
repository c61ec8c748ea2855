//! Signing-Slot Pool
//!
//! A fixed set of logical signing slots, each with its own sequence counter
//! (nonce) and exclusivity flag. Slots let several batches be in flight at once
//! without two transactions claiming the same `(public key, nonce)` pair.
//!
//! Slots that share one underlying key interleave their nonces: with `n` slots
//! on a key whose chain nonce is `base`, slot `r` starts at `base + r` and
//! advances by `n` on every release. Slots with their own key behave as fully
//! independent sequences (`n == 1`).
//!
//! When every slot is busy, `allocate` waits (bounded by `acquire_timeout`)
//! instead of handing out a slot that is already in use.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::transfer::adapters::SequenceProvider;
use crate::transfer::error::SlotError;

/// Key material backing one or more slots
#[derive(Clone, PartialEq, Eq)]
pub struct SlotKey {
    pub public_key: String,
    pub secret_key: String,
}

impl SlotKey {
    pub fn new(public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotKey")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

struct SlotEntry {
    key: Arc<SlotKey>,
    /// Stored nonce; the next submission uses `nonce + 1`
    nonce: u64,
    /// Number of slots sharing this key
    stride: u64,
    in_use: bool,
}

struct PoolState {
    slots: Vec<SlotEntry>,
    /// Where the next round-robin scan starts
    next_index: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// One permit per free slot
    permits: Arc<Semaphore>,
    /// Callers currently blocked in `allocate`
    waiting: AtomicUsize,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive lease on one slot
///
/// Returned to the pool by [`SlotPool::release`], or automatically on drop.
pub struct SigningSlot {
    index: usize,
    key: Arc<SlotKey>,
    nonce: u64,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SigningSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn public_key(&self) -> &str {
        &self.key.public_key
    }

    pub fn secret_key(&self) -> &str {
        &self.key.secret_key
    }

    /// Nonce stored in the slot at allocation time
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Nonce the transaction must carry
    pub fn submit_nonce(&self) -> u64 {
        self.nonce + 1
    }

    fn release_inner(&mut self) {
        let Some(permit) = self.permit.take() else {
            return; // already released
        };
        {
            let mut state = self.shared.state();
            let entry = &mut state.slots[self.index];
            entry.nonce += entry.stride;
            entry.in_use = false;
            log::debug!(
                "Released signing slot {}, next nonce {}",
                self.index,
                entry.nonce + 1
            );
        }
        // Slot state is updated before the permit lets a waiter in
        drop(permit);
    }
}

impl Drop for SigningSlot {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for SigningSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSlot")
            .field("index", &self.index)
            .field("public_key", &self.key.public_key)
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// Min/max of the stored slot nonces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NonceRange {
    pub min: u64,
    pub max: u64,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotPoolStats {
    pub total: usize,
    /// Slots currently leased
    pub active: usize,
    /// Slots free to lease
    pub available: usize,
    /// Callers blocked waiting for a slot
    pub locked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce_range: Option<NonceRange>,
}

pub struct SlotPool {
    shared: Arc<PoolShared>,
    acquire_timeout: Duration,
}

impl SlotPool {
    /// Build a pool of `slot_count` slots over `keys` (assigned round-robin).
    ///
    /// The starting sequence is queried once per distinct public key.
    pub async fn initialize<P: SequenceProvider + ?Sized>(
        provider: &P,
        account_id: &str,
        keys: &[SlotKey],
        slot_count: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, SlotError> {
        if slot_count == 0 || keys.is_empty() {
            return Err(SlotError::EmptyPool);
        }
        if keys.len() > slot_count {
            log::warn!(
                "{} signing keys configured but only {} slots; extra keys are unused",
                keys.len(),
                slot_count
            );
        }

        log::info!("Initializing {} signing slots for {}", slot_count, account_id);

        let keys: Vec<Arc<SlotKey>> = keys.iter().take(slot_count).cloned().map(Arc::new).collect();

        let mut group_size: HashMap<&str, u64> = HashMap::new();
        for i in 0..slot_count {
            *group_size.entry(keys[i % keys.len()].public_key.as_str()).or_default() += 1;
        }

        let mut bases: HashMap<String, u64> = HashMap::new();
        for key in &keys {
            if bases.contains_key(&key.public_key) {
                continue;
            }
            let base = provider
                .query_starting_sequence(account_id, &key.public_key)
                .await?;
            log::info!("Current nonce from network for {}: {}", key.public_key, base);
            bases.insert(key.public_key.clone(), base);
        }

        let mut rank: HashMap<&str, u64> = HashMap::new();
        let mut slots = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            let key = &keys[i % keys.len()];
            let pk = key.public_key.as_str();
            let r = rank.entry(pk).or_default();
            let nonce = bases[pk] + *r;
            *r += 1;
            log::info!("Initialized signing slot {}/{} with nonce {}", i + 1, slot_count, nonce);
            slots.push(SlotEntry {
                key: key.clone(),
                nonce,
                stride: group_size[pk],
                in_use: false,
            });
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState { slots, next_index: 0 }),
                permits: Arc::new(Semaphore::new(slot_count)),
                waiting: AtomicUsize::new(0),
            }),
            acquire_timeout,
        })
    }

    /// Lease the next free slot, scanning round-robin from the slot after the
    /// last allocation. Waits up to `acquire_timeout` when all slots are busy.
    pub async fn allocate(&self) -> Result<SigningSlot, SlotError> {
        self.shared.waiting.fetch_add(1, Ordering::Relaxed);
        let acquired = tokio::time::timeout(
            self.acquire_timeout,
            self.shared.permits.clone().acquire_owned(),
        )
        .await;
        self.shared.waiting.fetch_sub(1, Ordering::Relaxed);

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SlotError::EmptyPool),
            Err(_) => {
                log::warn!("All signing slots busy for {:?}", self.acquire_timeout);
                return Err(SlotError::Exhausted(self.acquire_timeout));
            }
        };

        let mut state = self.shared.state();
        let len = state.slots.len();
        let start = state.next_index;
        for offset in 0..len {
            let index = (start + offset) % len;
            let entry = &mut state.slots[index];
            if entry.in_use {
                continue;
            }
            entry.in_use = true;
            let slot = SigningSlot {
                index,
                key: entry.key.clone(),
                nonce: entry.nonce,
                shared: self.shared.clone(),
                permit: Some(permit),
            };
            state.next_index = (index + 1) % len;
            log::debug!("Allocated signing slot {} with nonce {}", index, slot.nonce);
            return Ok(slot);
        }

        // A permit guarantees a free slot; reaching this means the pool state
        // and the semaphore disagree.
        log::error!("Signing slot permit acquired but no slot is free");
        Err(SlotError::EmptyPool)
    }

    /// Return a slot, advancing its nonce past every value the other slots on
    /// the same key can produce
    pub fn release(&self, mut slot: SigningSlot) {
        slot.release_inner();
    }

    pub fn size(&self) -> usize {
        self.shared.state().slots.len()
    }

    pub fn stats(&self) -> SlotPoolStats {
        let state = self.shared.state();
        let active = state.slots.iter().filter(|s| s.in_use).count();
        let nonce_range = state
            .slots
            .iter()
            .map(|s| s.nonce)
            .fold(None, |range: Option<NonceRange>, n| match range {
                None => Some(NonceRange { min: n, max: n }),
                Some(r) => Some(NonceRange { min: r.min.min(n), max: r.max.max(n) }),
            });
        SlotPoolStats {
            total: state.slots.len(),
            active,
            available: state.slots.len() - active,
            locked: self.shared.waiting.load(Ordering::Relaxed),
            nonce_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::error::ChainError;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct FixedSequence(HashMap<String, u64>);

    #[async_trait]
    impl SequenceProvider for FixedSequence {
        async fn query_starting_sequence(&self, _account: &str, pk: &str) -> Result<u64, ChainError> {
            self.0
                .get(pk)
                .copied()
                .ok_or_else(|| ChainError::Rpc(format!("unknown key {}", pk)))
        }
    }

    fn provider(entries: &[(&str, u64)]) -> FixedSequence {
        FixedSequence(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    async fn single_key_pool(count: usize, timeout_ms: u64) -> SlotPool {
        SlotPool::initialize(
            &provider(&[("pk", 100)]),
            "sender.testnet",
            &[SlotKey::new("pk", "sk")],
            count,
            Duration::from_millis(timeout_ms),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_nonces_are_offset() {
        let pool = single_key_pool(3, 100).await;
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.nonce_range, Some(NonceRange { min: 100, max: 102 }));
    }

    #[tokio::test]
    async fn test_round_robin_allocation() {
        let pool = single_key_pool(3, 100).await;

        let a = pool.allocate().await.unwrap();
        let b = pool.allocate().await.unwrap();
        assert_eq!((a.index(), a.nonce()), (0, 100));
        assert_eq!((b.index(), b.nonce()), (1, 101));
        assert_eq!(a.submit_nonce(), 101);

        pool.release(a);
        // Scan resumes after the last allocated slot
        let c = pool.allocate().await.unwrap();
        assert_eq!((c.index(), c.nonce()), (2, 102));

        let d = pool.allocate().await.unwrap();
        assert_eq!(d.index(), 0);
        assert_eq!(d.nonce(), 103);
        assert_eq!(pool.stats().active, 3);
    }

    #[tokio::test]
    async fn test_release_advances_by_stride() {
        let pool = single_key_pool(4, 100).await;
        let slot = pool.allocate().await.unwrap();
        assert_eq!(slot.nonce(), 100);
        pool.release(slot);
        assert_eq!(pool.stats().nonce_range, Some(NonceRange { min: 101, max: 104 }));
    }

    #[tokio::test]
    async fn test_drop_releases_slot() {
        let pool = single_key_pool(1, 100).await;
        {
            let _slot = pool.allocate().await.unwrap();
            assert_eq!(pool.stats().available, 0);
        }
        assert_eq!(pool.stats().available, 1);
        let again = pool.allocate().await.unwrap();
        assert_eq!(again.nonce(), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_times_out() {
        let pool = single_key_pool(1, 50).await;
        let _held = pool.allocate().await.unwrap();
        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, SlotError::Exhausted(_)));
        assert_eq!(pool.stats().locked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_slot_after_release() {
        let pool = Arc::new(single_key_pool(1, 1_000).await);
        let held = pool.allocate().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.allocate().await.map(|s| s.nonce()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().locked, 1);

        pool.release(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 101);
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let pool = SlotPool::initialize(
            &provider(&[("a", 10), ("b", 500)]),
            "sender.testnet",
            &[SlotKey::new("a", "sa"), SlotKey::new("b", "sb")],
            4,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let slots: Vec<SigningSlot> = vec![
            pool.allocate().await.unwrap(),
            pool.allocate().await.unwrap(),
            pool.allocate().await.unwrap(),
            pool.allocate().await.unwrap(),
        ];
        let view: Vec<(&str, u64)> = slots.iter().map(|s| (s.public_key(), s.nonce())).collect();
        assert_eq!(view, vec![("a", 10), ("b", 500), ("a", 11), ("b", 501)]);

        let first = slots.into_iter().next().unwrap();
        pool.release(first);
        // Key "a" is shared by two slots
        let again = pool.allocate().await.unwrap();
        assert_eq!((again.public_key(), again.nonce()), ("a", 12));
    }

    #[tokio::test]
    async fn test_empty_pool_rejected() {
        let result = SlotPool::initialize(
            &provider(&[("pk", 1)]),
            "sender.testnet",
            &[SlotKey::new("pk", "sk")],
            0,
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(SlotError::EmptyPool)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_concurrent_nonce_collision() {
        let pool = Arc::new(single_key_pool(3, 5_000).await);
        let in_flight: Arc<Mutex<HashSet<(String, u64)>>> = Arc::default();
        let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::default();

        let mut tasks = Vec::new();
        for i in 0..24u64 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let seen = seen.clone();
            tasks.push(tokio::spawn(async move {
                let slot = pool.allocate().await.unwrap();
                let pair = (slot.public_key().to_string(), slot.submit_nonce());
                assert!(in_flight.lock().unwrap().insert(pair.clone()), "pair in use twice");
                seen.lock().unwrap().push(pair.clone());
                tokio::time::sleep(Duration::from_millis(1 + i % 4)).await;
                in_flight.lock().unwrap().remove(&pair);
                pool.release(slot);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every submission nonce was used exactly once over the whole run
        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().cloned().collect();
        assert_eq!(unique.len(), 24);
        assert_eq!(pool.stats().available, 3);
    }
}
