// tests/limiter/failure_mode_tests.rs

#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use std::time::Duration;

    use crate::{init_tracing, test_config, FlakyStore};
    use hivemind_limiter::clock::ManualClock;
    use hivemind_limiter::ratelimit::{
        DecisionReason, FailureMode, HealthState, PolicySet, RateLimitPolicy, RateLimiter,
    };
    use hivemind_limiter::LimiterConfig;
    use tokio_test::assert_ok;

    fn policies() -> PolicySet {
        PolicySet::new()
            .with_policy(RateLimitPolicy::token_bucket("open", 3, 1.0, FailureMode::FailOpen).unwrap())
            .unwrap()
            .with_policy(RateLimitPolicy::token_bucket("closed", 3, 1.0, FailureMode::FailClosed).unwrap())
            .unwrap()
            .with_policy(RateLimitPolicy::token_bucket("local", 3, 1.0, FailureMode::LocalFallback).unwrap())
            .unwrap()
    }

    fn setup(config: &LimiterConfig) -> (ManualClock, FlakyStore, RateLimiter) {
        init_tracing();
        let clock = ManualClock::new(0);
        let store = FlakyStore::new(&clock);
        let limiter =
            RateLimiter::with_local_clock(Arc::new(store.clone()), policies(), config, Arc::new(clock.clone()))
                .unwrap();
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn fail_open_admits_everything() {
        let (_clock, store, limiter) = setup(&test_config());
        store.set_down(true);

        for _ in 0..20 {
            let decision = assert_ok!(limiter.check([("user", "1")], 1, "open").await);
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::FailOpen);
        }
    }

    #[tokio::test]
    async fn fail_closed_denies_everything() {
        let (_clock, store, limiter) = setup(&test_config());
        store.set_down(true);

        for _ in 0..20 {
            let decision = assert_ok!(limiter.check([("user", "1")], 1, "closed").await);
            assert!(!decision.allowed);
            assert_eq!(decision.reason, DecisionReason::StoreUnavailable);
            assert_eq!(decision.retry_after_ms, 100);
        }
    }

    #[tokio::test]
    async fn local_fallback_enforces_local_capacity() {
        let (clock, store, limiter) = setup(&test_config());
        store.set_down(true);

        for expected in [2, 1, 0] {
            let decision = assert_ok!(limiter.check([("user", "1")], 1, "local").await);
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::LocalFallback);
            assert_eq!(decision.remaining, expected);
        }

        let denied = assert_ok!(limiter.check([("user", "1")], 1, "local").await);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::LocalOverLimit);
        assert_eq!(denied.retry_after_ms, 1000);

        clock.advance(1000);
        let decision = assert_ok!(limiter.check([("user", "1")], 1, "local").await);
        assert_eq!(decision.reason, DecisionReason::LocalFallback);
    }

    #[tokio::test]
    async fn full_local_cache_denies_new_keys() {
        let mut config = test_config();
        config.fallback.max_keys = 2;
        let (_clock, store, limiter) = setup(&config);
        store.set_down(true);

        assert!(assert_ok!(limiter.check([("user", "1")], 1, "local").await).allowed);
        assert!(assert_ok!(limiter.check([("user", "2")], 1, "local").await).allowed);

        let denied = assert_ok!(limiter.check([("user", "3")], 1, "local").await);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::LocalOverLimit);
        assert_eq!(limiter.local_bucket_count(), 2);
    }

    #[tokio::test]
    async fn degraded_mode_skips_the_store() {
        let (_clock, store, limiter) = setup(&test_config());
        store.set_down(true);

        for _ in 0..3 {
            assert_ok!(limiter.check([("user", "1")], 1, "open").await);
        }
        assert_eq!(limiter.health_state(), HealthState::Degraded);
        assert_eq!(store.evaluations(), 3);

        for _ in 0..10 {
            assert_ok!(limiter.check([("user", "1")], 1, "closed").await);
        }
        assert_eq!(store.evaluations(), 3);
    }

    #[tokio::test]
    async fn intermittent_failures_do_not_degrade() {
        let (_clock, store, limiter) = setup(&test_config());

        for _ in 0..5 {
            store.set_down(true);
            assert_ok!(limiter.check([("user", "1")], 1, "open").await);
            assert_ok!(limiter.check([("user", "1")], 1, "open").await);
            store.set_down(false);
            assert_ok!(limiter.check([("user", "2")], 1, "open").await);
        }

        assert_eq!(limiter.health_state(), HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_counts_as_failure() {
        let (_clock, store, limiter) = setup(&test_config());
        store.set_delay(Duration::from_millis(500));

        let decision = assert_ok!(limiter.check([("user", "1")], 1, "closed").await);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::StoreUnavailable);

        // Within the per-policy timeout the answer comes from the store.
        let patient = RateLimitPolicy::token_bucket("patient", 3, 1.0, FailureMode::FailClosed)
            .unwrap()
            .with_store_timeout(Duration::from_secs(1))
            .unwrap();
        limiter.set_policies(PolicySet::new().with_policy(patient).unwrap());

        let decision = assert_ok!(limiter.check([("user", "1")], 1, "patient").await);
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_restores_service_and_clears_local_state() {
        let mut config = test_config();
        config.health.degraded_threshold = 1;
        config.health.recovery_threshold = 2;
        let (_clock, store, limiter) = setup(&config);

        store.set_down(true);
        let decision = assert_ok!(limiter.check([("user", "1")], 1, "local").await);
        assert_eq!(decision.reason, DecisionReason::LocalFallback);
        assert_eq!(limiter.health_state(), HealthState::Degraded);
        assert_eq!(limiter.local_bucket_count(), 1);
        assert!(limiter.health_probe_running());

        // Pings keep failing while the store is down.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(limiter.health_state(), HealthState::Degraded);
        assert!(store.pings() >= 3);

        store.set_down(false);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.health_state(), HealthState::Healthy);
        assert_eq!(limiter.local_bucket_count(), 0);

        let decision = assert_ok!(limiter.check([("user", "1")], 1, "local").await);
        assert_eq!(decision.reason, DecisionReason::Ok);

        limiter.shutdown().await;
        assert!(!limiter.health_probe_running());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_closed_recovers_on_its_own() {
        let (_clock, store, limiter) = setup(&test_config());
        assert!(!limiter.health_probe_running());

        store.set_down(true);
        for _ in 0..3 {
            let decision = assert_ok!(limiter.check([("user", "1")], 1, "closed").await);
            assert_eq!(decision.reason, DecisionReason::StoreUnavailable);
        }
        assert_eq!(limiter.health_state(), HealthState::Degraded);
        assert_eq!(store.evaluations(), 3);

        store.set_down(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(limiter.health_state(), HealthState::Healthy);

        let decision = assert_ok!(limiter.check([("user", "1")], 1, "closed").await);
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Ok);
        assert_eq!(store.evaluations(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_store_is_not_pinged() {
        let (_clock, store, limiter) = setup(&test_config());
        assert!(limiter.start_health_probe());
        assert!(!limiter.start_health_probe());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.pings(), 0);

        limiter.shutdown().await;
    }
}
