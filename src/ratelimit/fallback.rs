//! Instance-local admission used while the shared store is unreachable.
//!
//! Buckets here are private to one process, so during an outage every instance admits
//! up to the full policy capacity on its own: the fleet-wide limit becomes
//! `capacity × live instances` in the worst case. Callers opt into this trade-off per
//! policy with `failure_mode: local-fallback`.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::descriptor::BucketKey;
use super::policy::{evaluate, Algorithm, BucketState, Evaluation, Verdict};
use crate::clock::Clock;

#[derive(Debug)]
struct LocalBucket {
    state: BucketState,
    last_seen_ms: u64,
}

/// Per-instance bucket cache.
#[derive(Debug)]
pub struct LocalFallback {
    instance_id: String,
    buckets: DashMap<BucketKey, LocalBucket>,
    clock: Arc<dyn Clock>,
    max_keys: usize,
    idle_ttl_ms: u64,
}

impl LocalFallback {
    pub fn new(instance_id: String, clock: Arc<dyn Clock>, max_keys: usize, idle_ttl_ms: u64) -> Self {
        Self {
            instance_id,
            buckets: DashMap::new(),
            clock,
            max_keys: max_keys.max(1),
            idle_ttl_ms,
        }
    }

    /// Identifier scoping this cache's buckets.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evaluate a request against this instance's bucket for `key`.
    ///
    /// Returns `None` when the cache is full of active buckets and `key` is new.
    pub fn evaluate(&self, key: &BucketKey, algorithm: &Algorithm, cost: u64) -> Option<Evaluation> {
        let now_ms = self.clock.now_ms();

        if self.buckets.len() >= self.max_keys && !self.buckets.contains_key(key) {
            self.sweep(now_ms);
            if self.buckets.len() >= self.max_keys {
                warn!(
                    instance_id = %self.instance_id,
                    max_keys = self.max_keys,
                    "Local fallback cache is full"
                );
                return None;
            }
        }

        let evaluation = match self.buckets.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                bucket.last_seen_ms = now_ms;
                evaluate(algorithm, &mut bucket.state, now_ms, cost)
            }
            Entry::Vacant(vacant) => {
                let mut state = BucketState::fresh(algorithm, now_ms);
                let evaluation = evaluate(algorithm, &mut state, now_ms, cost);
                vacant.insert(LocalBucket {
                    state,
                    last_seen_ms: now_ms,
                });
                evaluation
            }
        };

        trace!(
            instance_id = %self.instance_id,
            key = %key,
            allowed = evaluation.verdict == Verdict::Admitted,
            "Local fallback decision"
        );
        Some(evaluation)
    }

    /// Drop buckets idle for longer than the idle TTL. Returns how many were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        let cutoff = now_ms.saturating_sub(self.idle_ttl_ms);
        self.buckets.retain(|_, bucket| bucket.last_seen_ms > cutoff);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(instance_id = %self.instance_id, removed = removed, "Swept idle local buckets");
        }
        removed
    }

    /// Forget all local state.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}
