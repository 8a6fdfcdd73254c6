// tests/limiter/redis_tests.rs
//
// These run against a live Redis and are skipped unless REDIS_URL is set, e.g.
// REDIS_URL=redis://127.0.0.1:6379/0 cargo test --test limiter redis

#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use std::time::Duration;

    use crate::{redis_store, test_config};
    use futures::future::join_all;
    use hivemind_limiter::ratelimit::{
        BucketKey, DecisionReason, FailureMode, PolicySet, RateLimitPolicy, RateLimiter, Verdict,
    };
    use hivemind_limiter::store::CounterStore;
    use tokio_test::assert_ok;

    fn limiter_over(store: hivemind_limiter::store::RedisCounterStore, policy: RateLimitPolicy) -> RateLimiter {
        RateLimiter::with_config(Arc::new(store), PolicySet::new().with_policy(policy).unwrap(), &test_config())
            .unwrap()
    }

    async fn connection(url: &str) -> redis::aio::MultiplexedConnection {
        redis::Client::open(url)
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn redis_token_bucket_drains_then_refills() {
        let Some((_url, _prefix, store)) = redis_store("tb_scenario").await else {
            return;
        };
        let policy = RateLimitPolicy::token_bucket("api", 5, 1.0, FailureMode::FailClosed).unwrap();
        let limiter = limiter_over(store, policy);
        let dims = [("tenant", "acme")];

        for expected in [4, 3, 2, 1, 0] {
            let decision = assert_ok!(limiter.check(dims, 1, "api").await);
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::Ok);
            assert_eq!(decision.remaining, expected);
        }

        let denied = assert_ok!(limiter.check(dims, 1, "api").await);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::OverLimit);
        assert!(denied.retry_after_ms > 0 && denied.retry_after_ms <= 1000);

        tokio::time::sleep(Duration::from_millis(denied.retry_after_ms + 5)).await;
        let decision = assert_ok!(limiter.check(dims, 1, "api").await);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn redis_denial_writes_nothing_and_keys_are_hash_tagged() {
        let Some((url, prefix, store)) = redis_store("tb_state").await else {
            return;
        };
        let policy = RateLimitPolicy::token_bucket("api", 2, 0.001, FailureMode::FailClosed).unwrap();
        let key = BucketKey::resolve(&policy, [("tenant", "acme")]).unwrap();
        let redis_key = format!("{}{{{}}}:tb", prefix, key);
        let mut conn = connection(&url).await;

        for _ in 0..2 {
            assert!(store.evaluate(&key, policy.algorithm(), 1).await.unwrap().allowed());
        }
        let ts_after_admit: String = redis::cmd("HGET")
            .arg(&redis_key)
            .arg("ts")
            .query_async(&mut conn)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let denied = store.evaluate(&key, policy.algorithm(), 1).await.unwrap();
        assert_eq!(denied.verdict, Verdict::OverLimit);

        let ts_after_denial: String = redis::cmd("HGET")
            .arg(&redis_key)
            .arg("ts")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(ts_after_admit, ts_after_denial);

        // Full refill takes 2000s; state lives for twice that.
        let ttl_ms: i64 = redis::cmd("PTTL").arg(&redis_key).query_async(&mut conn).await.unwrap();
        assert!(ttl_ms > 3_000_000 && ttl_ms <= 4_000_000, "unexpected ttl {}", ttl_ms);
    }

    #[tokio::test]
    async fn redis_cost_exceeding_capacity_is_flagged() {
        let Some((_url, _prefix, store)) = redis_store("tb_oversized").await else {
            return;
        };
        let policy = RateLimitPolicy::token_bucket("api", 5, 1.0, FailureMode::FailClosed).unwrap();
        let key = BucketKey::resolve(&policy, [("tenant", "acme")]).unwrap();

        let eval = store.evaluate(&key, policy.algorithm(), 10).await.unwrap();
        assert_eq!(eval.verdict, Verdict::CostExceedsCapacity);
        assert_eq!(eval.remaining_units(), 5);

        let limiter = limiter_over(store, policy);
        let decision = assert_ok!(limiter.check([("tenant", "acme")], 10, "api").await);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::CostExceedsCapacity);

        // Nothing was consumed.
        assert!(assert_ok!(limiter.check([("tenant", "acme")], 5, "api").await).allowed);
    }

    #[tokio::test]
    async fn redis_sliding_window_denies_until_oldest_entry_leaves() {
        let Some((_url, _prefix, store)) = redis_store("sw_retry").await else {
            return;
        };
        let policy = RateLimitPolicy::sliding_window("login", 500, 3, FailureMode::FailClosed).unwrap();
        let limiter = limiter_over(store, policy);
        let dims = [("user", "bob")];

        assert!(assert_ok!(limiter.check(dims, 2, "login").await).allowed);
        let decision = assert_ok!(limiter.check(dims, 1, "login").await);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        // Cost 2 needs the first entry (cost 2) gone, not just any entry.
        let denied = assert_ok!(limiter.check(dims, 2, "login").await);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::OverLimit);
        assert!(denied.retry_after_ms > 0 && denied.retry_after_ms <= 501);

        // Denials are not recorded.
        let again = assert_ok!(limiter.check(dims, 2, "login").await);
        assert!(!again.allowed);

        tokio::time::sleep(Duration::from_millis(denied.retry_after_ms + 5)).await;
        assert!(assert_ok!(limiter.check(dims, 2, "login").await).allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn redis_concurrent_checks_admit_exactly_capacity() {
        let Some((_url, _prefix, store)) = redis_store("tb_concurrency").await else {
            return;
        };
        let policy = RateLimitPolicy::token_bucket("api", 10, 0.001, FailureMode::FailClosed)
            .unwrap()
            .with_store_timeout(Duration::from_secs(2))
            .unwrap();
        let limiter = Arc::new(limiter_over(store, policy));

        let tasks = (0..64).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check([("tenant", "acme")], 1, "api").await })
        });

        let decisions: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(decisions.iter().all(|d| d.reason == DecisionReason::Ok || d.reason == DecisionReason::OverLimit));
        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 10);
    }
}
