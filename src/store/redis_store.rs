//! Redis counter store.
//!
//! Enable with the `redis-store` feature flag. Bucket state is a small hash
//! per key (`tokens`, `last_refill_ms`); consume/refund/penalize run as Lua
//! scripts so the refill-and-take step is evaluated atomically server-side.
//! Timestamps are wall-clock milliseconds so workers on different hosts
//! agree on elapsed time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ConsumeReply, CounterStore, StoreError, StoreResult};
use crate::clock::Clock;

const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local cost = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local rate = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(bucket[1])
local last = tonumber(bucket[2])
if tokens == nil then
  tokens = capacity
  last = now_ms
end

local elapsed = math.max(0, now_ms - last) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)

local ok = 0
if tokens >= cost then
  tokens = tokens - cost
  ok = 1
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('EXPIRE', key, ttl)

local retry_ms = 0
if ok == 0 and rate > 0 then
  retry_ms = math.ceil((cost - tokens) / rate * 1000.0)
end
return {ok, tostring(tokens), retry_ms}
"#;

const REFUND_SCRIPT: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])

local tokens = tonumber(redis.call('HGET', key, 'tokens'))
if tokens == nil then
  return 0
end
redis.call('HSET', key, 'tokens', math.min(capacity, tokens + amount))
return 1
"#;

const PENALIZE_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local target = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local tokens = tonumber(redis.call('HGET', key, 'tokens'))
if tokens == nil or tokens > target then
  tokens = target
end
redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('EXPIRE', key, ttl)
return 1
"#;

/// Counter store over a shared Redis deployment.
pub struct RedisCounterStore {
    client: Arc<redis::Client>,
    clock: Arc<dyn Clock>,
    consume: redis::Script,
    refund: redis::Script,
    penalize: redis::Script,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            clock,
            consume: redis::Script::new(CONSUME_SCRIPT),
            refund: redis::Script::new(REFUND_SCRIPT),
            penalize: redis::Script::new(PENALIZE_SCRIPT),
        })
    }

    async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_wall().timestamp_millis()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn consume(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> StoreResult<ConsumeReply> {
        let mut conn = self.connection().await?;
        let (ok, tokens, retry_ms): (i64, String, i64) = self
            .consume
            .key(key)
            .arg(self.now_ms())
            .arg(cost)
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let remaining = tokens
            .parse::<f64>()
            .map_err(|e| StoreError::Unavailable(format!("malformed bucket state: {e}")))?;
        Ok(ConsumeReply {
            ok: ok == 1,
            remaining,
            retry_after: Duration::from_millis(retry_ms.max(0) as u64),
        })
    }

    async fn refund(&self, key: &str, amount: f64, capacity: f64) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = self
            .refund
            .key(key)
            .arg(amount)
            .arg(capacity)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn penalize(
        &self,
        key: &str,
        unavailable_for: Duration,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let target = 1.0 - refill_per_sec * unavailable_for.as_secs_f64();
        let mut conn = self.connection().await?;
        let _: i64 = self
            .penalize
            .key(key)
            .arg(self.now_ms())
            .arg(target)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn remaining(&self, key: &str, capacity: f64, refill_per_sec: f64) -> StoreResult<f64> {
        let mut conn = self.connection().await?;
        let state: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("last_refill_ms")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let (Some(Some(tokens)), Some(Some(last))) = (state.first(), state.get(1)) else {
            return Ok(capacity);
        };
        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| StoreError::Unavailable(format!("malformed bucket state: {e}")))?;
        let last = last
            .parse::<i64>()
            .map_err(|e| StoreError::Unavailable(format!("malformed bucket state: {e}")))?;
        let elapsed = (self.now_ms() - last).max(0) as f64 / 1000.0;
        Ok((tokens + elapsed * refill_per_sec).min(capacity))
    }
}
