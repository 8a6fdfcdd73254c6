//! Hivemind Limiter - Distributed Rate Limiting
//!
//! This crate decides whether a request may proceed under a named policy. Counter state
//! for every bucket lives in a shared [`store::CounterStore`] (Redis in production), so
//! all instances of a service enforce the same fleet-wide limit. When the store is
//! unreachable each policy's failure mode decides: fail open, fail closed, or fall back
//! to per-instance local buckets.
//!
//! ```no_run
//! # async fn run() -> hivemind_limiter::error::Result<()> {
//! use hivemind_limiter::config::LimiterConfig;
//! use hivemind_limiter::ratelimit::RateLimiter;
//!
//! let config = LimiterConfig::load(Some("hivemind.yaml"))?;
//! let limiter = RateLimiter::from_config(&config).await?;
//!
//! let decision = limiter.check([("tenant", "acme")], 1, "api").await?;
//! if !decision.allowed {
//!     println!("retry in {}ms", decision.retry_after_ms);
//! }
//!
//! limiter.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::LimiterConfig;
pub use error::{LimiterError, Result};
pub use ratelimit::{Decision, DecisionReason, FailureMode, PolicySet, RateLimitPolicy, RateLimiter};
