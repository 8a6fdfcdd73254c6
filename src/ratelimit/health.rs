//! Store health tracking and the background probe.
//!
//! The limiter starts `Healthy`. Consecutive store failures on the request path move it
//! to `Degraded`, after which requests no longer wait on the store at all. Only the
//! periodic probe can bring it back: `recovery_threshold` consecutive successful pings
//! return the service to `Healthy`.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::CounterClient;

const STATE_HEALTHY: u8 = 0;
const STATE_DEGRADED: u8 = 1;

/// Service-level view of the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Requests are decided by the shared store
    Healthy,
    /// Requests are decided by each policy's failure mode
    Degraded,
}

/// Consecutive-outcome counters driving [`HealthState`] transitions.
#[derive(Debug)]
pub struct StoreHealth {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_probe_successes: AtomicU32,
    degraded_threshold: u32,
    recovery_threshold: u32,
}

impl StoreHealth {
    /// Thresholds below one are treated as one.
    pub fn new(degraded_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            state: AtomicU8::new(STATE_HEALTHY),
            consecutive_failures: AtomicU32::new(0),
            consecutive_probe_successes: AtomicU32::new(0),
            degraded_threshold: degraded_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
        }
    }

    pub fn state(&self) -> HealthState {
        match self.state.load(Ordering::Acquire) {
            STATE_DEGRADED => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == HealthState::Degraded
    }

    /// A request-path store call succeeded.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// A request-path store call failed. Returns `true` if this call degraded the service.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.degraded_threshold {
            return false;
        }

        let degraded = self
            .state
            .compare_exchange(STATE_HEALTHY, STATE_DEGRADED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if degraded {
            self.consecutive_probe_successes.store(0, Ordering::Release);
            warn!(
                consecutive_failures = failures,
                "Counter store unreachable, switching to degraded mode"
            );
        }
        degraded
    }

    /// A probe succeeded. Returns `true` if this probe restored the service.
    pub fn record_probe_success(&self) -> bool {
        if !self.is_degraded() {
            return false;
        }

        let successes = self.consecutive_probe_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes < self.recovery_threshold {
            debug!(successes = successes, needed = self.recovery_threshold, "Store probe succeeded");
            return false;
        }

        let recovered = self
            .state
            .compare_exchange(STATE_DEGRADED, STATE_HEALTHY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if recovered {
            self.consecutive_failures.store(0, Ordering::Release);
            self.consecutive_probe_successes.store(0, Ordering::Release);
            info!("Counter store reachable again, leaving degraded mode");
        }
        recovered
    }

    /// A probe failed.
    pub fn record_probe_failure(&self) {
        self.consecutive_probe_successes.store(0, Ordering::Release);
    }
}

/// Timing of the background probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSchedule {
    /// Base delay between probes
    pub interval: Duration,
    /// Upper bound of the random delay added to each interval
    pub jitter: Duration,
}

impl ProbeSchedule {
    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Handle to a running probe loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct ProbeHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProbeHandle {
    /// Stop the probe loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the probe loop on the current Tokio runtime.
///
/// While the service is healthy the loop only sleeps; it pings the store only in
/// `Degraded`, and `on_recovered` runs each time a probe restores the service.
pub fn spawn_prober<F>(
    client: CounterClient,
    health: Arc<StoreHealth>,
    schedule: ProbeSchedule,
    on_recovered: F,
) -> ProbeHandle
where
    F: Fn() + Send + Sync + 'static,
{
    let (tx, mut rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        info!(interval_ms = schedule.interval.as_millis() as u64, "Starting store health probe");
        loop {
            tokio::select! {
                _ = &mut rx => {
                    debug!("Store health probe stopped");
                    break;
                }
                _ = tokio::time::sleep(schedule.next_delay()) => {}
            }

            if !health.is_degraded() {
                continue;
            }

            match client.ping().await {
                Ok(()) => {
                    if health.record_probe_success() {
                        on_recovered();
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Store health probe failed");
                    health.record_probe_failure();
                }
            }
        }
    });

    ProbeHandle {
        shutdown: Some(tx),
        task: Some(task),
    }
}
