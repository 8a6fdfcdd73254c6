//! Rate limiting logic and state management.

mod decision;
mod descriptor;
mod fallback;
mod health;
mod limiter;
mod policy;
mod rules;

pub use decision::{Decision, DecisionReason};
pub use descriptor::{BucketKey, ABSENT_SENTINEL};
pub use fallback::LocalFallback;
pub use health::{spawn_prober, HealthState, ProbeHandle, ProbeSchedule, StoreHealth};
pub use limiter::RateLimiter;
pub use policy::{
    evaluate, evaluate_sliding_window, evaluate_token_bucket, refill, Algorithm, BucketState,
    Evaluation, SlidingWindowState, TokenBucketState, Verdict, TOKEN_EPSILON,
};
pub use rules::{
    AlgorithmKind, FailureMode, PolicyDefinition, PolicyFile, PolicySet, RateLimitPolicy,
    ScopeDimension, TimeUnit, MAX_CAPACITY, MAX_WINDOW_SIZE_MS,
};
