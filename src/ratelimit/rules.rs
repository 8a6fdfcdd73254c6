//! Rate limit policy definitions and loading.
//!
//! Policies are read from YAML, validated once, and then shared immutably. A policy file
//! looks like:
//!
//! ```yaml
//! policies:
//!   - name: api
//!     algorithm: token_bucket
//!     capacity: 100
//!     refill_rate_per_second: 10
//!     failure_mode: local-fallback
//!     dimensions:
//!       - name: tenant
//!       - name: route
//!       - name: client
//!         optional: true
//!   - name: login
//!     algorithm: sliding_window
//!     unit: minute
//!     max_in_window: 5
//!     failure_mode: fail-closed
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::descriptor::normalize_component;
use super::policy::Algorithm;
use crate::error::{LimiterError, Result};

/// How a policy behaves while the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Admit everything
    FailOpen,
    /// Deny everything
    FailClosed,
    /// Count locally on this instance
    LocalFallback,
}

/// Algorithm selector in policy files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    SlidingWindow,
}

/// Named window lengths accepted in place of `window_size_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of the unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// One dimension of a policy's key scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDimension {
    /// Dimension name, e.g. `tenant`
    pub name: String,
    /// Absent values are replaced by a sentinel instead of being rejected
    #[serde(default)]
    pub optional: bool,
}

impl ScopeDimension {
    /// A dimension every request must carry.
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
        }
    }

    /// A dimension that may be absent.
    pub fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: true,
        }
    }
}

/// A policy as written in a policy file, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    /// Policy name used by callers of `check`
    pub name: String,
    /// Admission algorithm
    pub algorithm: AlgorithmKind,
    /// Token bucket capacity
    #[serde(default)]
    pub capacity: Option<u64>,
    /// Token bucket refill rate
    #[serde(default)]
    pub refill_rate_per_second: Option<f64>,
    /// Sliding window length
    #[serde(default)]
    pub window_size_ms: Option<u64>,
    /// Sliding window length as a named unit
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Sliding window limit
    #[serde(default)]
    pub max_in_window: Option<u64>,
    /// Cost charged when the caller passes zero
    #[serde(default = "default_cost")]
    pub cost_default: u64,
    /// Behavior while the store is unavailable. Deliberately has no default.
    pub failure_mode: FailureMode,
    /// Key scope, in key order
    #[serde(default)]
    pub dimensions: Vec<ScopeDimension>,
    /// Per-policy override of the store timeout
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,
}

fn default_cost() -> u64 {
    1
}

/// Largest accepted capacity or window limit. Counts up to this are exact as `f64`,
/// which is also how the Redis scripts hold them.
pub const MAX_CAPACITY: u64 = 1 << 53;

/// Longest accepted sliding window: one year.
pub const MAX_WINDOW_SIZE_MS: u64 = 366 * 24 * 60 * 60 * 1000;

/// A validated, immutable rate limit policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    name: String,
    algorithm: Algorithm,
    cost_default: u64,
    failure_mode: FailureMode,
    dimensions: Vec<ScopeDimension>,
    store_timeout: Option<Duration>,
}

impl RateLimitPolicy {
    /// Create a token bucket policy.
    pub fn token_bucket(
        name: &str,
        capacity: u64,
        refill_rate_per_second: f64,
        failure_mode: FailureMode,
    ) -> Result<Self> {
        Self::new(
            name,
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            },
            failure_mode,
        )
    }

    /// Create a sliding window policy.
    pub fn sliding_window(
        name: &str,
        window_size_ms: u64,
        max_in_window: u64,
        failure_mode: FailureMode,
    ) -> Result<Self> {
        Self::new(
            name,
            Algorithm::SlidingWindow {
                window_size_ms,
                max_in_window,
            },
            failure_mode,
        )
    }

    /// Create a policy from an algorithm, validating its parameters.
    pub fn new(name: &str, algorithm: Algorithm, failure_mode: FailureMode) -> Result<Self> {
        let policy = Self {
            name: normalize_component(name)
                .ok_or_else(|| LimiterError::InvalidPolicy("policy name is empty".to_string()))?,
            algorithm,
            cost_default: default_cost(),
            failure_mode,
            dimensions: Vec::new(),
            store_timeout: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Declare the key scope.
    pub fn with_dimensions(mut self, dimensions: Vec<ScopeDimension>) -> Result<Self> {
        self.dimensions = dimensions;
        self.validate()?;
        Ok(self)
    }

    /// Set the cost charged when callers pass zero.
    pub fn with_cost_default(mut self, cost_default: u64) -> Result<Self> {
        self.cost_default = cost_default;
        self.validate()?;
        Ok(self)
    }

    /// Override the store timeout for this policy.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.store_timeout = Some(timeout);
        self.validate()?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    /// Maximum cost a single request can be admitted with.
    pub fn capacity(&self) -> u64 {
        self.algorithm.capacity()
    }

    pub fn cost_default(&self) -> u64 {
        self.cost_default
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn dimensions(&self) -> &[ScopeDimension] {
        &self.dimensions
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(LimiterError::InvalidPolicy(format!("{}: {}", self.name, reason)));

        match self.algorithm {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => {
                if capacity == 0 {
                    return invalid("capacity must be positive".to_string());
                }
                if capacity > MAX_CAPACITY {
                    return invalid(format!("capacity must be at most {}", MAX_CAPACITY));
                }
                if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
                    return invalid(format!(
                        "refill_rate_per_second must be a positive number (got {})",
                        refill_rate_per_second
                    ));
                }
            }
            Algorithm::SlidingWindow {
                window_size_ms,
                max_in_window,
            } => {
                if window_size_ms == 0 {
                    return invalid("window_size_ms must be positive".to_string());
                }
                if window_size_ms > MAX_WINDOW_SIZE_MS {
                    return invalid(format!("window_size_ms must be at most {}", MAX_WINDOW_SIZE_MS));
                }
                if max_in_window == 0 {
                    return invalid("max_in_window must be positive".to_string());
                }
                if max_in_window > MAX_CAPACITY {
                    return invalid(format!("max_in_window must be at most {}", MAX_CAPACITY));
                }
            }
        }

        if self.cost_default == 0 {
            return invalid("cost_default must be positive".to_string());
        }
        if self.cost_default > self.capacity() {
            return invalid(format!(
                "cost_default {} exceeds capacity {}",
                self.cost_default,
                self.capacity()
            ));
        }

        if self.store_timeout == Some(Duration::ZERO) {
            return invalid("store_timeout_ms must be positive".to_string());
        }

        let mut seen = Vec::with_capacity(self.dimensions.len());
        for dimension in &self.dimensions {
            match normalize_component(&dimension.name) {
                Some(name) if seen.contains(&name) => {
                    return invalid(format!("dimension '{}' declared twice", name));
                }
                Some(name) => seen.push(name),
                None => return invalid("dimension name is empty".to_string()),
            }
        }

        Ok(())
    }
}

impl TryFrom<PolicyDefinition> for RateLimitPolicy {
    type Error = LimiterError;

    fn try_from(def: PolicyDefinition) -> Result<Self> {
        let missing =
            |field: &str| LimiterError::InvalidPolicy(format!("{}: missing '{}'", def.name, field));

        let algorithm = match def.algorithm {
            AlgorithmKind::TokenBucket => Algorithm::TokenBucket {
                capacity: def.capacity.ok_or_else(|| missing("capacity"))?,
                refill_rate_per_second: def
                    .refill_rate_per_second
                    .ok_or_else(|| missing("refill_rate_per_second"))?,
            },
            AlgorithmKind::SlidingWindow => {
                let window_size_ms = match (def.window_size_ms, def.unit) {
                    (Some(ms), None) => ms,
                    (None, Some(unit)) => unit.duration().as_millis() as u64,
                    (Some(_), Some(_)) => {
                        return Err(LimiterError::InvalidPolicy(format!(
                            "{}: set either 'window_size_ms' or 'unit', not both",
                            def.name
                        )))
                    }
                    (None, None) => return Err(missing("window_size_ms")),
                };
                Algorithm::SlidingWindow {
                    window_size_ms,
                    max_in_window: def
                        .max_in_window
                        .or(def.capacity)
                        .ok_or_else(|| missing("max_in_window"))?,
                }
            }
        };

        let mut policy = RateLimitPolicy::new(&def.name, algorithm, def.failure_mode)?;
        policy.cost_default = def.cost_default;
        policy.dimensions = def.dimensions;
        policy.store_timeout = def.store_timeout_ms.map(Duration::from_millis);
        policy.validate()?;
        Ok(policy)
    }
}

/// Policy file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

/// The set of policies a limiter enforces, keyed by normalized name.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, Arc<RateLimitPolicy>>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::InvalidPolicy(format!("Failed to parse policy file: {}", e)))?;

        let mut set = PolicySet::new();
        for definition in file.policies {
            set.insert(RateLimitPolicy::try_from(definition)?)?;
        }
        Ok(set)
    }

    /// Add a policy. Names must be unique.
    pub fn insert(&mut self, policy: RateLimitPolicy) -> Result<()> {
        if self.policies.contains_key(policy.name()) {
            return Err(LimiterError::InvalidPolicy(format!(
                "policy '{}' defined more than once",
                policy.name()
            )));
        }
        self.policies.insert(policy.name().to_string(), Arc::new(policy));
        Ok(())
    }

    /// Builder-style [`PolicySet::insert`].
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Result<Self> {
        self.insert(policy)?;
        Ok(self)
    }

    /// Look up a policy by name; the name is normalized like policy names in files.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimitPolicy>> {
        let name = normalize_component(name)?;
        self.policies.get(&name).cloned()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Names of all policies, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }
}
