//! The result handed back to callers of `check`.

use serde::{Deserialize, Serialize};

use super::policy::{Evaluation, Verdict};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Admitted by the shared store
    Ok,
    /// Denied by the shared store; retry later
    OverLimit,
    /// Denied; the cost can never fit the policy
    CostExceedsCapacity,
    /// Denied because the store is unreachable and the policy fails closed
    StoreUnavailable,
    /// Admitted without consulting the store because the policy fails open
    FailOpen,
    /// Admitted by this instance's local fallback bucket
    LocalFallback,
    /// Denied by this instance's local fallback bucket
    LocalOverLimit,
}

impl DecisionReason {
    /// Stable wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Ok => "ok",
            DecisionReason::OverLimit => "over_limit",
            DecisionReason::CostExceedsCapacity => "cost_exceeds_capacity",
            DecisionReason::StoreUnavailable => "store_unavailable",
            DecisionReason::FailOpen => "fail_open",
            DecisionReason::LocalFallback => "local_fallback",
            DecisionReason::LocalOverLimit => "local_over_limit",
        }
    }

    /// Whether the decision was made without the shared store.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            DecisionReason::StoreUnavailable
                | DecisionReason::FailOpen
                | DecisionReason::LocalFallback
                | DecisionReason::LocalOverLimit
        )
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole units of capacity left after this request
    pub remaining: u64,
    /// How long to wait before retrying; zero when allowed or not computable
    pub retry_after_ms: u64,
    /// How long until the bucket is back to full capacity
    pub reset_after_ms: u64,
    /// Why
    pub reason: DecisionReason,
}

impl Decision {
    /// Decision for a store evaluation.
    pub fn from_evaluation(evaluation: &Evaluation) -> Self {
        let reason = match evaluation.verdict {
            Verdict::Admitted => DecisionReason::Ok,
            Verdict::OverLimit => DecisionReason::OverLimit,
            Verdict::CostExceedsCapacity => DecisionReason::CostExceedsCapacity,
        };
        Self::with_reason(evaluation, reason)
    }

    /// Decision for a local fallback evaluation.
    pub fn from_local_evaluation(evaluation: &Evaluation) -> Self {
        let reason = match evaluation.verdict {
            Verdict::Admitted => DecisionReason::LocalFallback,
            Verdict::OverLimit => DecisionReason::LocalOverLimit,
            Verdict::CostExceedsCapacity => DecisionReason::CostExceedsCapacity,
        };
        Self::with_reason(evaluation, reason)
    }

    /// Permanent denial of a cost larger than the policy's capacity.
    pub fn cost_exceeds_capacity() -> Self {
        Self::denied(DecisionReason::CostExceedsCapacity, 0)
    }

    pub(crate) fn denied(reason: DecisionReason, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_ms,
            reset_after_ms: 0,
            reason,
        }
    }

    pub(crate) fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining: 0,
            retry_after_ms: 0,
            reset_after_ms: 0,
            reason: DecisionReason::FailOpen,
        }
    }

    fn with_reason(evaluation: &Evaluation, reason: DecisionReason) -> Self {
        let allowed = evaluation.allowed();
        Self {
            allowed,
            remaining: evaluation.remaining_units(),
            retry_after_ms: if allowed { 0 } else { evaluation.retry_after_ms },
            reset_after_ms: evaluation.reset_after_ms,
            reason,
        }
    }
}
