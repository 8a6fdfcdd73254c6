//! Redis-backed counter store.
//!
//! Every evaluation is a single `EVALSHA` of a Lua script that reads the bucket, applies
//! refill or window expiry using the Redis server clock, decides, and writes back only on
//! admission. Redis runs scripts atomically, so concurrent instances cannot interleave
//! between the read and the write.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{CounterStore, StoreError};
use crate::ratelimit::{Algorithm, BucketKey, Evaluation, Verdict, TOKEN_EPSILON};

/// Default prefix for all keys written by the limiter.
pub const DEFAULT_KEY_PREFIX: &str = "hivemind:ratelimit:";

/// KEYS[1] = bucket hash.
/// ARGV = capacity, refill rate per second, cost, ttl ms, epsilon.
/// Returns {verdict, remaining, retry_after_ms, reset_after_ms, now_ms}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
redis.replicate_commands()
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local eps = tonumber(ARGV[5])

-- Full double precision so stored tokens round-trip exactly.
local function fmt(n)
  return string.format('%.17g', n)
end

local function ceil_ms(ms)
  if ms <= 0 then return 0 end
  return math.ceil(ms - 0.000001)
end

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = math.max(0, now - ts)
local available = math.max(math.min(capacity, tokens + elapsed / 1000 * rate), math.min(tokens, capacity))

if cost > capacity then
  return {2, fmt(available), 0, ceil_ms((capacity - available) / rate * 1000), now}
end

if available + eps >= cost then
  local left = math.max(0, available - cost)
  redis.call('HSET', KEYS[1], 'tokens', fmt(left), 'ts', fmt(math.max(ts, now)))
  redis.call('PEXPIRE', KEYS[1], ttl)
  return {0, fmt(left), 0, ceil_ms((capacity - left) / rate * 1000), now}
end

return {1, fmt(available), ceil_ms((cost - available) / rate * 1000),
        ceil_ms((capacity - available) / rate * 1000), now}
"#;

/// KEYS[1] = sorted set of admitted requests (score = ms, member = "seq:cost"),
/// KEYS[2] = member sequence counter.
/// ARGV = window ms, max in window, cost, ttl ms.
/// Returns {verdict, remaining, retry_after_ms, reset_after_ms, now_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.replicate_commands()
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local window = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (now - window))
local entries = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')

local count = 0
for i = 1, #entries, 2 do
  count = count + tonumber(string.match(entries[i], ':(%d+)$'))
end

local function reset_after()
  local newest = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
  if #newest == 0 then return 0 end
  return math.max(0, tonumber(newest[2]) + window + 1 - now)
end

if cost > max then
  return {2, tostring(math.max(0, max - count)), 0, reset_after(), now}
end

if count + cost <= max then
  local newest = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
  local ts = now
  if #newest > 0 then ts = math.max(now, tonumber(newest[2])) end
  local seq = redis.call('INCR', KEYS[2])
  redis.call('ZADD', KEYS[1], ts, seq .. ':' .. cost)
  redis.call('PEXPIRE', KEYS[1], ttl)
  redis.call('PEXPIRE', KEYS[2], ttl)
  return {0, tostring(max - count - cost), 0, reset_after(), now}
end

local freed = 0
local retry = 0
for i = 1, #entries, 2 do
  freed = freed + tonumber(string.match(entries[i], ':(%d+)$'))
  if count - freed + cost <= max then
    retry = math.max(0, tonumber(entries[i + 1]) + window + 1 - now)
    break
  end
end

return {1, tostring(math.max(0, max - count)), retry, reset_after(), now}
"#;

type ScriptReply = (i64, String, i64, i64, i64);

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    ttl_safety_factor: u32,
    token_bucket: Script,
    sliding_window: Script,
}

impl RedisCounterStore {
    /// Connect to Redis at `url` and verify the connection with `PING`.
    pub async fn connect(url: &str, key_prefix: &str, ttl_safety_factor: u32) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid Redis URL: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        let store = Self::with_connection(connection, key_prefix, ttl_safety_factor);
        store.ping().await?;

        info!(key_prefix = %store.key_prefix, "Connected to Redis counter store");
        Ok(store)
    }

    /// Build a store on an existing connection manager.
    pub fn with_connection(connection: ConnectionManager, key_prefix: &str, ttl_safety_factor: u32) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.to_string(),
            ttl_safety_factor: ttl_safety_factor.max(1),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    /// Redis key for one part of a bucket's state.
    ///
    /// The bucket key sits inside a hash tag so all parts map to the same cluster slot.
    fn redis_key(&self, key: &BucketKey, suffix: &str) -> String {
        redis_key(&self.key_prefix, key, suffix)
    }
}

fn redis_key(prefix: &str, key: &BucketKey, suffix: &str) -> String {
    format!("{}{{{}}}:{}", prefix, key, suffix)
}

fn parse_reply(reply: ScriptReply) -> Result<Evaluation, StoreError> {
    let (verdict, remaining, retry_after_ms, reset_after_ms, now_ms) = reply;

    let verdict = match verdict {
        0 => Verdict::Admitted,
        1 => Verdict::OverLimit,
        2 => Verdict::CostExceedsCapacity,
        other => return Err(StoreError::Protocol(format!("unknown verdict {}", other))),
    };
    let remaining: f64 = remaining
        .parse()
        .map_err(|_| StoreError::Protocol(format!("remaining is not a number: {:?}", remaining)))?;

    Ok(Evaluation {
        verdict,
        remaining,
        retry_after_ms: retry_after_ms.max(0) as u64,
        reset_after_ms: reset_after_ms.max(0) as u64,
        now_ms: now_ms.max(0) as u64,
    })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn evaluate(
        &self,
        key: &BucketKey,
        algorithm: &Algorithm,
        cost: u64,
    ) -> Result<Evaluation, StoreError> {
        let mut connection = self.connection.clone();
        let ttl_ms = algorithm.state_ttl_ms(self.ttl_safety_factor);

        let reply: ScriptReply = match algorithm {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => {
                self.token_bucket
                    .key(self.redis_key(key, "tb"))
                    .arg(*capacity)
                    .arg(*refill_rate_per_second)
                    .arg(cost)
                    .arg(ttl_ms)
                    .arg(TOKEN_EPSILON)
                    .invoke_async(&mut connection)
                    .await?
            }
            Algorithm::SlidingWindow {
                window_size_ms,
                max_in_window,
            } => {
                self.sliding_window
                    .key(self.redis_key(key, "win"))
                    .key(self.redis_key(key, "seq"))
                    .arg(*window_size_ms)
                    .arg(*max_in_window)
                    .arg(cost)
                    .arg(ttl_ms)
                    .invoke_async(&mut connection)
                    .await?
            }
        };

        let evaluation = parse_reply(reply)?;
        debug!(key = %key, verdict = ?evaluation.verdict, remaining = evaluation.remaining, "Redis evaluation");
        Ok(evaluation)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl_safety_factor", &self.ttl_safety_factor)
            .finish()
    }
}
