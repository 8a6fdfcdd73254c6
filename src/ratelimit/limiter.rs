//! The rate limiter facade.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use super::decision::{Decision, DecisionReason};
use super::descriptor::BucketKey;
use super::fallback::LocalFallback;
use super::health::{spawn_prober, HealthState, ProbeHandle, ProbeSchedule, StoreHealth};
use super::rules::{FailureMode, PolicySet, RateLimitPolicy};
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterConfig, StoreBackend};
use crate::error::{LimiterError, Result};
use crate::store::{CounterClient, CounterStore, InMemoryCounterStore, RedisCounterStore};

/// Decides whether requests may proceed.
///
/// This struct is thread-safe and can be shared across multiple tasks. Counter state
/// lives in the [`CounterStore`]; the limiter itself only holds policies, the store
/// health and the local fallback cache.
///
/// The limiter owns its store health probe. It is started by
/// [`RateLimiter::from_config`], or at the latest when the store first degrades, and
/// stops when the limiter is dropped or [`RateLimiter::shutdown`] is called.
pub struct RateLimiter {
    policies: RwLock<PolicySet>,
    client: CounterClient,
    health: Arc<StoreHealth>,
    fallback: Arc<LocalFallback>,
    probe_schedule: ProbeSchedule,
    probe: Mutex<Option<ProbeHandle>>,
}

impl RateLimiter {
    /// Create a limiter over `store` with default settings.
    pub fn new(store: Arc<dyn CounterStore>, policies: PolicySet) -> Self {
        Self::build(store, policies, &LimiterConfig::default(), Arc::new(SystemClock))
    }

    /// Create a limiter over `store` using the health, fallback and timeout settings
    /// from `config`. The store backend settings of `config` are not used.
    pub fn with_config(store: Arc<dyn CounterStore>, policies: PolicySet, config: &LimiterConfig) -> Result<Self> {
        Self::with_local_clock(store, policies, config, Arc::new(SystemClock))
    }

    /// Like [`RateLimiter::with_config`], with `clock` driving the local fallback cache.
    pub fn with_local_clock(
        store: Arc<dyn CounterStore>,
        policies: PolicySet,
        config: &LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate_timing()?;
        Ok(Self::build(store, policies, config, clock))
    }

    fn build(
        store: Arc<dyn CounterStore>,
        policies: PolicySet,
        config: &LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fallback = LocalFallback::new(
            config.instance_id(),
            clock,
            config.fallback.max_keys,
            config.fallback.idle_ttl_ms,
        );

        info!(
            instance_id = %fallback.instance_id(),
            policies = policies.len(),
            store_timeout_ms = config.store.timeout_ms,
            "Rate limiter created"
        );

        Self {
            policies: RwLock::new(policies),
            client: CounterClient::new(store, config.store_timeout()),
            health: Arc::new(StoreHealth::new(
                config.health.degraded_threshold,
                config.health.recovery_threshold,
            )),
            fallback: Arc::new(fallback),
            probe_schedule: ProbeSchedule {
                interval: config.probe_interval(),
                jitter: Duration::from_millis(config.health.probe_jitter_ms),
            },
            probe: Mutex::new(None),
        }
    }

    /// Build the configured store and policies and create a limiter over them.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;

        let policies = match config.policies_path.as_deref() {
            Some(path) => PolicySet::from_file(path)?,
            None => PolicySet::new(),
        };

        let store: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(
                InMemoryCounterStore::new().with_ttl_safety_factor(config.store.ttl_safety_factor),
            ),
            StoreBackend::Redis => {
                let url = config
                    .store
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| LimiterError::Config("store.redis_url is not set".to_string()))?;
                Arc::new(
                    RedisCounterStore::connect(url, &config.store.key_prefix, config.store.ttl_safety_factor)
                        .await?,
                )
            }
        };

        let limiter = Self::with_config(store, policies, config)?;
        limiter.start_health_probe();
        Ok(limiter)
    }

    /// Check whether a request of `cost` described by `dimensions` may proceed under the
    /// policy named `policy_name`, consuming capacity if it may.
    ///
    /// A `cost` of zero means the policy's default cost. Errors are only returned for
    /// unknown policies and invalid dimensions; store failures are resolved by the
    /// policy's failure mode.
    #[instrument(skip(self, dimensions), fields(policy = %policy_name))]
    pub async fn check<I, K, V>(&self, dimensions: I, cost: u64, policy_name: &str) -> Result<Decision>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let policy = self
            .policies
            .read()
            .get(policy_name)
            .ok_or_else(|| LimiterError::InvalidPolicy(format!("Unknown policy '{}'", policy_name)))?;

        let cost = if cost == 0 { policy.cost_default() } else { cost };
        let key = BucketKey::resolve(&policy, dimensions)?;

        trace!(key = %key, cost = cost, "Checking rate limit");

        if !policy.algorithm().admits_cost(cost) {
            debug!(key = %key, cost = cost, capacity = policy.capacity(), "Cost exceeds capacity");
            return Ok(Decision::cost_exceeds_capacity());
        }

        if self.health.is_degraded() {
            return Ok(self.decide_without_store(&policy, &key, cost));
        }

        match self
            .client
            .check_and_consume(&key, policy.algorithm(), cost, policy.store_timeout())
            .await
        {
            Ok(evaluation) => {
                self.health.record_success();
                let decision = Decision::from_evaluation(&evaluation);
                if !decision.allowed {
                    debug!(
                        key = %key,
                        reason = %decision.reason,
                        retry_after_ms = decision.retry_after_ms,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    failure_mode = ?policy.failure_mode(),
                    "Counter store call failed"
                );
                if self.health.record_failure() {
                    self.start_health_probe();
                }
                Ok(self.decide_without_store(&policy, &key, cost))
            }
        }
    }

    /// [`RateLimiter::check`] with the policy's default cost.
    pub async fn check_default<I, K, V>(&self, dimensions: I, policy_name: &str) -> Result<Decision>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.check(dimensions, 0, policy_name).await
    }

    fn decide_without_store(&self, policy: &RateLimitPolicy, key: &BucketKey, cost: u64) -> Decision {
        match policy.failure_mode() {
            FailureMode::FailOpen => Decision::fail_open(),
            FailureMode::FailClosed => Decision::denied(
                DecisionReason::StoreUnavailable,
                self.probe_schedule.interval.as_millis() as u64,
            ),
            FailureMode::LocalFallback => match self.fallback.evaluate(key, policy.algorithm(), cost) {
                Some(evaluation) => Decision::from_local_evaluation(&evaluation),
                None => Decision::denied(
                    DecisionReason::LocalOverLimit,
                    self.probe_schedule.interval.as_millis() as u64,
                ),
            },
        }
    }

    /// Replace the active policies. Checks already in flight finish under the old set.
    pub fn set_policies(&self, policies: PolicySet) {
        info!(policies = policies.len(), "Replacing rate limit policies");
        *self.policies.write() = policies;
    }

    /// Snapshot of the active policies.
    pub fn policies(&self) -> PolicySet {
        self.policies.read().clone()
    }

    pub fn health_state(&self) -> HealthState {
        self.health.state()
    }

    /// Number of buckets held by the local fallback cache.
    pub fn local_bucket_count(&self) -> usize {
        self.fallback.len()
    }

    /// Identifier scoping this instance's local fallback buckets.
    pub fn instance_id(&self) -> &str {
        self.fallback.instance_id()
    }

    /// Start the background store probe on the current Tokio runtime unless it is
    /// already running. Returns `true` if this call started it.
    pub fn start_health_probe(&self) -> bool {
        let mut probe = self.probe.lock();
        if probe.is_some() {
            return false;
        }

        let fallback = Arc::clone(&self.fallback);
        *probe = Some(spawn_prober(
            self.client.clone(),
            Arc::clone(&self.health),
            self.probe_schedule,
            move || {
                fallback.clear();
                debug!("Cleared local fallback buckets");
            },
        ));
        true
    }

    /// Whether the store health probe is running.
    pub fn health_probe_running(&self) -> bool {
        self.probe.lock().is_some()
    }

    /// Stop the store health probe and wait for it to exit.
    pub async fn shutdown(&self) {
        let probe = self.probe.lock().take();
        if let Some(probe) = probe {
            probe.shutdown().await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policies", &self.policies.read().names())
            .field("client", &self.client)
            .field("health", &self.health.state())
            .field("instance_id", &self.fallback.instance_id())
            .finish()
    }
}
