// tests/limiter/concurrency_tests.rs

#[cfg(test)]
mod tests {

    use std::sync::Arc;

    use crate::limiter_with_clock;
    use futures::future::join_all;
    use hivemind_limiter::clock::ManualClock;
    use hivemind_limiter::ratelimit::{FailureMode, PolicySet, RateLimitPolicy};
    use rand::Rng;

    fn single(policy: RateLimitPolicy) -> PolicySet {
        PolicySet::new().with_policy(policy).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_capacity() {
        let clock = ManualClock::new(0);
        let policy = RateLimitPolicy::token_bucket("api", 10, 1.0, FailureMode::FailClosed).unwrap();
        let (_store, limiter) = limiter_with_clock(single(policy), &clock);
        let limiter = Arc::new(limiter);

        let tasks = (0..64).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check([("tenant", "acme")], 1, "api").await })
        });

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|decision| decision.allowed)
            .count();

        assert_eq!(admitted, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sliding_window_checks_admit_exactly_limit() {
        let clock = ManualClock::new(0);
        let policy = RateLimitPolicy::sliding_window("api", 1000, 7, FailureMode::FailClosed).unwrap();
        let (_store, limiter) = limiter_with_clock(single(policy), &clock);
        let limiter = Arc::new(limiter);

        let tasks = (0..40).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check([("tenant", "acme")], 1, "api").await })
        });

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| joined.as_ref().unwrap().as_ref().unwrap().allowed)
            .count();

        assert_eq!(admitted, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fewer_requests_than_capacity_all_admitted() {
        let clock = ManualClock::new(0);
        let policy = RateLimitPolicy::token_bucket("api", 100, 1.0, FailureMode::FailClosed).unwrap();
        let (_store, limiter) = limiter_with_clock(single(policy), &clock);
        let limiter = Arc::new(limiter);

        let tasks = (0..30).map(|i| {
            let limiter = Arc::clone(&limiter);
            let tenant = format!("tenant-{}", i % 3);
            tokio::spawn(async move { limiter.check([("tenant", tenant.as_str())], 1, "api").await })
        });

        for joined in join_all(tasks).await {
            assert!(joined.unwrap().unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn token_bucket_never_exceeds_capacity_plus_refill() {
        let clock = ManualClock::new(0);
        let (capacity, rate) = (10u64, 2.0f64);
        let policy = RateLimitPolicy::token_bucket("api", capacity, rate, FailureMode::FailClosed).unwrap();
        let (_store, limiter) = limiter_with_clock(single(policy), &clock);
        let mut rng = rand::thread_rng();

        let mut elapsed_ms = 0u64;
        let mut admitted = 0u64;
        for _ in 0..500 {
            let step = rng.gen_range(0..300);
            clock.advance(step);
            elapsed_ms += step;

            let cost = rng.gen_range(1..=3);
            let decision = limiter.check([("tenant", "acme")], cost, "api").await.unwrap();
            if decision.allowed {
                admitted += cost;
            }

            let bound = capacity as f64 + rate * elapsed_ms as f64 / 1000.0;
            assert!(admitted as f64 <= bound + 1e-6, "admitted {} > bound {}", admitted, bound);
        }
    }

    #[tokio::test]
    async fn sliding_window_never_exceeds_limit_in_any_window() {
        let clock = ManualClock::new(0);
        let (window, max) = (1000u64, 20u64);
        let policy = RateLimitPolicy::sliding_window("api", window, max, FailureMode::FailClosed).unwrap();
        let (_store, limiter) = limiter_with_clock(single(policy), &clock);
        let mut rng = rand::thread_rng();

        let mut now = 0u64;
        let mut admitted: Vec<(u64, u64)> = Vec::new();
        for _ in 0..500 {
            let step = rng.gen_range(0..80);
            clock.advance(step);
            now += step;

            let cost = rng.gen_range(1..=4);
            if limiter.check([("tenant", "acme")], cost, "api").await.unwrap().allowed {
                admitted.push((now, cost));
            }
        }

        for &(end, _) in &admitted {
            let start = end.saturating_sub(window);
            let in_window: u64 = admitted
                .iter()
                .filter(|(ts, _)| *ts >= start && *ts <= end)
                .map(|(_, cost)| cost)
                .sum();
            assert!(in_window <= max, "{} admitted in window ending at {}", in_window, end);
        }
    }
}
