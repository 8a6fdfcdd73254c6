//! Shared counter stores.
//!
//! A [`CounterStore`] owns all bucket state. Its single mutating operation reads the
//! state, applies refill or expiry, decides, and writes back as one atomic unit as seen
//! by every instance sharing the store. The limiter talks to a store only through
//! [`CounterClient`], which bounds every call with a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

use crate::ratelimit::{Algorithm, BucketKey, Evaluation};

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Errors surfaced by counter stores.
///
/// All variants mean "no decision was obtained"; none of them implies the request was
/// admitted or denied.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store did not answer within the configured timeout
    #[error("Store timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached or refused the command
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something that is not a valid evaluation
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Unavailable(format!("timed out: {}", err))
        } else if err.kind() == ::redis::ErrorKind::TypeError {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// The atomic primitive required from a shared counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically evaluate a request of `cost` against the bucket named `key` and commit
    /// the consumption if it is admitted. Denials must not consume capacity.
    ///
    /// The store's own clock is authoritative for the evaluation time.
    async fn evaluate(
        &self,
        key: &BucketKey,
        algorithm: &Algorithm,
        cost: u64,
    ) -> Result<Evaluation, StoreError>;

    /// Cheap liveness check used by the health probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Timeout-bounded access to a [`CounterStore`].
#[derive(Clone)]
pub struct CounterClient {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl CounterClient {
    /// Wrap `store`, bounding every call by `timeout`.
    pub fn new(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Default timeout applied when a policy does not override it.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Atomically check and consume `cost` from the bucket.
    ///
    /// Dropping the returned future abandons the result; the store operation itself is
    /// either committed or not.
    pub async fn check_and_consume(
        &self,
        key: &BucketKey,
        algorithm: &Algorithm,
        cost: u64,
        timeout: Option<Duration>,
    ) -> Result<Evaluation, StoreError> {
        let timeout = timeout.unwrap_or(self.timeout);
        trace!(key = %key, cost = cost, timeout_ms = timeout.as_millis() as u64, "Evaluating in store");

        tokio::time::timeout(timeout, self.store.evaluate(key, algorithm, cost))
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }

    /// Ping the store within the default timeout.
    pub async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(self.timeout, self.store.ping())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

impl std::fmt::Debug for CounterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}
