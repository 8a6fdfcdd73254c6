//! Admission algorithms.
//!
//! Everything here is deterministic and free of I/O: given an algorithm, the current
//! bucket state, a timestamp and a cost, [`evaluate`] decides whether the request is
//! admitted and updates the state in place. Stores run this math under their own
//! atomicity guarantees; the Redis Lua scripts mirror it line for line.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Tolerance applied to token comparisons so rounding cannot flip a decision.
pub const TOKEN_EPSILON: f64 = 1e-9;

/// Tolerance subtracted before rounding a duration up to whole milliseconds.
const MS_EPSILON: f64 = 1e-6;

/// The admission algorithm of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// Continuously refilling bucket of `capacity` tokens.
    TokenBucket {
        /// Maximum tokens held by the bucket
        capacity: u64,
        /// Tokens added per second
        refill_rate_per_second: f64,
    },
    /// At most `max_in_window` cost units within any window of `window_size_ms`.
    SlidingWindow {
        /// Window length in milliseconds
        window_size_ms: u64,
        /// Maximum admitted cost per window
        max_in_window: u64,
    },
}

impl Algorithm {
    /// The largest cost a single request may ever be admitted with.
    pub fn capacity(&self) -> u64 {
        match self {
            Algorithm::TokenBucket { capacity, .. } => *capacity,
            Algorithm::SlidingWindow { max_in_window, .. } => *max_in_window,
        }
    }

    /// Whether a request of `cost` can ever be admitted.
    pub fn admits_cost(&self, cost: u64) -> bool {
        cost <= self.capacity()
    }

    /// Lifetime of idle bucket state: the time for the bucket to become "fresh" again,
    /// multiplied by `safety_factor`.
    pub fn state_ttl_ms(&self, safety_factor: u32) -> u64 {
        let base = match self {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => ceil_ms(*capacity as f64 / refill_rate_per_second * 1000.0),
            Algorithm::SlidingWindow { window_size_ms, .. } => *window_size_ms,
        };
        base.max(1).saturating_mul(u64::from(safety_factor.max(1)))
    }
}

/// Token bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    /// Tokens available at `last_refill_ms`
    pub tokens: f64,
    /// When `tokens` was last computed
    pub last_refill_ms: u64,
}

/// Sliding window state: admitted requests ordered by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlidingWindowState {
    entries: VecDeque<(u64, u64)>,
    total: u64,
}

impl SlidingWindowState {
    /// Admitted cost currently recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Recorded `(timestamp_ms, cost)` pairs, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &(u64, u64)> {
        self.entries.iter()
    }

    fn prune(&mut self, now_ms: u64, window_size_ms: u64) {
        let threshold = now_ms.saturating_sub(window_size_ms);
        while let Some(&(ts, cost)) = self.entries.front() {
            if ts >= threshold {
                break;
            }
            self.entries.pop_front();
            self.total -= cost;
        }
    }

    fn push(&mut self, now_ms: u64, cost: u64) {
        // Keep entries ordered even if the clock steps backwards.
        let ts = self.entries.back().map_or(now_ms, |&(last, _)| last.max(now_ms));
        self.entries.push_back((ts, cost));
        self.total = self.total.saturating_add(cost);
    }
}

/// Per-key mutable state tracked by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketState {
    /// State of a token bucket
    TokenBucket(TokenBucketState),
    /// State of a sliding window
    SlidingWindow(SlidingWindowState),
}

impl BucketState {
    /// A state that has never seen a request: a full bucket or an empty window.
    pub fn fresh(algorithm: &Algorithm, now_ms: u64) -> Self {
        match algorithm {
            Algorithm::TokenBucket { capacity, .. } => BucketState::TokenBucket(TokenBucketState {
                tokens: *capacity as f64,
                last_refill_ms: now_ms,
            }),
            Algorithm::SlidingWindow { .. } => {
                BucketState::SlidingWindow(SlidingWindowState::default())
            }
        }
    }

    fn matches(&self, algorithm: &Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (BucketState::TokenBucket(_), Algorithm::TokenBucket { .. })
                | (BucketState::SlidingWindow(_), Algorithm::SlidingWindow { .. })
        )
    }
}

/// Outcome class of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Admitted; the cost has been consumed
    Admitted,
    /// Denied for now; waiting `retry_after_ms` makes it admissible
    OverLimit,
    /// Denied permanently under this policy
    CostExceedsCapacity,
}

/// Result of evaluating one request against one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// What happened
    pub verdict: Verdict,
    /// Capacity left after this request (tokens, or window slots)
    pub remaining: f64,
    /// Wait before the same request could be admitted; zero when admitted
    pub retry_after_ms: u64,
    /// Wait until the bucket is back to full capacity
    pub reset_after_ms: u64,
    /// The timestamp the evaluation ran at
    pub now_ms: u64,
}

impl Evaluation {
    /// Whether the request was admitted.
    pub fn allowed(&self) -> bool {
        self.verdict == Verdict::Admitted
    }

    /// Remaining capacity as whole units.
    pub fn remaining_units(&self) -> u64 {
        (self.remaining + TOKEN_EPSILON).floor().max(0.0) as u64
    }
}

/// Evaluate a request of `cost` at `now_ms`.
///
/// `state` is modified only when the request is admitted, apart from dropping
/// sliding-window entries that have already left the window. A state left over from a
/// different algorithm is replaced by a fresh one.
pub fn evaluate(algorithm: &Algorithm, state: &mut BucketState, now_ms: u64, cost: u64) -> Evaluation {
    if !state.matches(algorithm) {
        *state = BucketState::fresh(algorithm, now_ms);
    }

    match (algorithm, state) {
        (
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            },
            BucketState::TokenBucket(bucket),
        ) => evaluate_token_bucket(*capacity, *refill_rate_per_second, bucket, now_ms, cost),
        (
            Algorithm::SlidingWindow {
                window_size_ms,
                max_in_window,
            },
            BucketState::SlidingWindow(window),
        ) => evaluate_sliding_window(*window_size_ms, *max_in_window, window, now_ms, cost),
        _ => unreachable!("bucket state was reset to match the algorithm"),
    }
}

/// Tokens available at `now_ms`, never above `capacity` and never below the stored value.
pub fn refill(capacity: u64, refill_rate_per_second: f64, state: &TokenBucketState, now_ms: u64) -> f64 {
    let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
    let refilled = state.tokens + elapsed_ms as f64 / 1000.0 * refill_rate_per_second;
    refilled.min(capacity as f64).max(state.tokens.min(capacity as f64))
}

/// Token bucket admission.
pub fn evaluate_token_bucket(
    capacity: u64,
    refill_rate_per_second: f64,
    state: &mut TokenBucketState,
    now_ms: u64,
    cost: u64,
) -> Evaluation {
    let available = refill(capacity, refill_rate_per_second, state, now_ms);
    let time_to_full =
        |tokens: f64| ceil_ms((capacity as f64 - tokens) / refill_rate_per_second * 1000.0);

    if cost > capacity {
        return Evaluation {
            verdict: Verdict::CostExceedsCapacity,
            remaining: available,
            retry_after_ms: 0,
            reset_after_ms: time_to_full(available),
            now_ms,
        };
    }

    let cost_tokens = cost as f64;
    if available + TOKEN_EPSILON >= cost_tokens {
        state.tokens = (available - cost_tokens).max(0.0);
        state.last_refill_ms = state.last_refill_ms.max(now_ms);
        Evaluation {
            verdict: Verdict::Admitted,
            remaining: state.tokens,
            retry_after_ms: 0,
            reset_after_ms: time_to_full(state.tokens),
            now_ms,
        }
    } else {
        Evaluation {
            verdict: Verdict::OverLimit,
            remaining: available,
            retry_after_ms: ceil_ms((cost_tokens - available) / refill_rate_per_second * 1000.0),
            reset_after_ms: time_to_full(available),
            now_ms,
        }
    }
}

/// Sliding window admission over the inclusive window `[now - window, now]`.
pub fn evaluate_sliding_window(
    window_size_ms: u64,
    max_in_window: u64,
    state: &mut SlidingWindowState,
    now_ms: u64,
    cost: u64,
) -> Evaluation {
    state.prune(now_ms, window_size_ms);
    let count = state.total;
    let expiry_of = |ts: u64| {
        ts.saturating_add(window_size_ms)
            .saturating_add(1)
            .saturating_sub(now_ms)
    };
    let reset_after = |state: &SlidingWindowState| {
        state.entries.back().map_or(0, |&(ts, _)| expiry_of(ts))
    };

    if cost > max_in_window {
        return Evaluation {
            verdict: Verdict::CostExceedsCapacity,
            remaining: max_in_window.saturating_sub(count) as f64,
            retry_after_ms: 0,
            reset_after_ms: reset_after(state),
            now_ms,
        };
    }

    if count + cost <= max_in_window {
        state.push(now_ms, cost);
        return Evaluation {
            verdict: Verdict::Admitted,
            remaining: (max_in_window - count - cost) as f64,
            retry_after_ms: 0,
            reset_after_ms: reset_after(state),
            now_ms,
        };
    }

    // Walk from the oldest entry until enough cost has left the window.
    let mut freed = 0;
    let mut retry_after_ms = 0;
    for &(ts, entry_cost) in &state.entries {
        freed += entry_cost;
        if count - freed + cost <= max_in_window {
            retry_after_ms = expiry_of(ts);
            break;
        }
    }

    Evaluation {
        verdict: Verdict::OverLimit,
        remaining: max_in_window.saturating_sub(count) as f64,
        retry_after_ms,
        reset_after_ms: reset_after(state),
        now_ms,
    }
}

/// Round a millisecond duration up, ignoring floating point noise.
pub(crate) fn ceil_ms(ms: f64) -> u64 {
    if !ms.is_finite() || ms <= 0.0 {
        return 0;
    }
    (ms - MS_EPSILON).ceil().max(0.0) as u64
}
