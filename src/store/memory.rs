//! In-process counter store.
//!
//! Suitable for a single instance and for tests. Each key's evaluation runs while holding
//! the key's `DashMap` entry, which makes it linearizable per key. Expired buckets are
//! dropped by a sweep that evaluations trigger at most once per purge interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{evaluate, Algorithm, BucketKey, BucketState, Evaluation};

/// Default multiple of the refill/window time idle state is kept for.
const DEFAULT_TTL_SAFETY_FACTOR: u32 = 2;

/// Default minimum time between sweeps of expired buckets.
const DEFAULT_PURGE_INTERVAL_MS: u64 = 10_000;

#[derive(Debug)]
struct StoredBucket {
    state: BucketState,
    expires_at_ms: u64,
}

/// Counter store holding bucket state in memory.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    buckets: Arc<DashMap<BucketKey, StoredBucket>>,
    clock: Arc<dyn Clock>,
    ttl_safety_factor: u32,
    purge_interval_ms: u64,
    next_purge_ms: Arc<AtomicU64>,
}

impl InMemoryCounterStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store using `clock` as its time authority.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            clock,
            ttl_safety_factor: DEFAULT_TTL_SAFETY_FACTOR,
            purge_interval_ms: DEFAULT_PURGE_INTERVAL_MS,
            next_purge_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override how many refill/window periods idle state survives.
    pub fn with_ttl_safety_factor(mut self, factor: u32) -> Self {
        self.ttl_safety_factor = factor.max(1);
        self
    }

    /// Override the minimum time between sweeps of expired buckets.
    pub fn with_purge_interval(mut self, interval_ms: u64) -> Self {
        self.purge_interval_ms = interval_ms.max(1);
        self
    }

    /// Number of stored buckets, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Snapshot of the live state for `key`.
    pub fn state(&self, key: &BucketKey) -> Option<BucketState> {
        let now_ms = self.clock.now_ms();
        self.buckets
            .get(key)
            .filter(|bucket| bucket.expires_at_ms > now_ms)
            .map(|bucket| bucket.state.clone())
    }

    /// Drop expired buckets. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(self.clock.now_ms())
    }

    /// Sweep if the purge interval has passed since the last sweep.
    fn purge_if_due(&self, now_ms: u64) {
        let due_ms = self.next_purge_ms.load(Ordering::Acquire);
        if now_ms < due_ms {
            return;
        }
        let next_ms = now_ms.saturating_add(self.purge_interval_ms);
        if self
            .next_purge_ms
            .compare_exchange(due_ms, next_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.purge_at(now_ms);
        }
    }

    fn purge_at(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at_ms > now_ms);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired buckets");
        }
        removed
    }

    /// Remove all state.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn evaluate(
        &self,
        key: &BucketKey,
        algorithm: &Algorithm,
        cost: u64,
    ) -> Result<Evaluation, StoreError> {
        let ttl_ms = algorithm.state_ttl_ms(self.ttl_safety_factor);

        // Must run before any entry guard is taken.
        self.purge_if_due(self.clock.now_ms());

        // The entry guard is held across read, evaluate and write.
        let mut entry = self.buckets.entry(key.clone()).or_insert_with(|| StoredBucket {
            state: BucketState::fresh(algorithm, 0),
            expires_at_ms: 0,
        });
        let now_ms = self.clock.now_ms();

        if entry.expires_at_ms <= now_ms {
            trace!(key = %key, "Bucket state absent or expired, starting fresh");
            entry.state = BucketState::fresh(algorithm, now_ms);
            entry.expires_at_ms = now_ms.saturating_add(ttl_ms);
        }

        let evaluation = evaluate(algorithm, &mut entry.state, now_ms, cost);
        if evaluation.allowed() {
            entry.expires_at_ms = now_ms.saturating_add(ttl_ms);
        }

        Ok(evaluation)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
