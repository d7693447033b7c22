//! In-memory counter store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ConsumeReply, CounterStore, StoreResult};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Duration,
    expires_at: Duration,
}

/// Counter store over a mutexed map. Deterministic under an injected
/// [`Clock`]; the mutex makes each operation atomic, matching the Redis
/// script semantics.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refreshed(state: &BucketState, now: Duration, capacity: f64, rate: f64) -> f64 {
        let elapsed = now.saturating_sub(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * rate).min(capacity)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn consume(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> StoreResult<ConsumeReply> {
        let now = self.clock.now_mono();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let fresh = BucketState {
            tokens: capacity,
            last_refill: now,
            expires_at: now + ttl,
        };
        let state = buckets.entry(key.to_string()).or_insert(fresh);
        // An expired day has self-reclaimed; start over from a full bucket.
        if state.expires_at <= now {
            *state = fresh;
        }

        let mut tokens = Self::refreshed(state, now, capacity, refill_per_sec);
        let ok = tokens >= cost;
        if ok {
            tokens -= cost;
        }
        *state = BucketState {
            tokens,
            last_refill: now,
            expires_at: now + ttl,
        };

        let retry_after = if ok || refill_per_sec <= 0.0 {
            // Countdown buckets never refill; callers defer on the key's
            // rollover instead.
            Duration::ZERO
        } else {
            Duration::from_secs_f64((cost - tokens) / refill_per_sec)
        };
        Ok(ConsumeReply {
            ok,
            remaining: tokens,
            retry_after,
        })
    }

    async fn refund(&self, key: &str, amount: f64, capacity: f64) -> StoreResult<()> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = buckets.get_mut(key) {
            state.tokens = (state.tokens + amount).min(capacity);
        }
        Ok(())
    }

    async fn penalize(
        &self,
        key: &str,
        unavailable_for: Duration,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = self.clock.now_mono();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let target = 1.0 - refill_per_sec * unavailable_for.as_secs_f64();
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: target,
            last_refill: now,
            expires_at: now + ttl,
        });
        if state.tokens > target {
            state.tokens = target;
        }
        state.last_refill = now;
        state.expires_at = now + ttl;
        Ok(())
    }

    async fn remaining(&self, key: &str, capacity: f64, refill_per_sec: f64) -> StoreResult<f64> {
        let now = self.clock.now_mono();
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(buckets
            .get(key)
            .filter(|state| state.expires_at > now)
            .map(|state| Self::refreshed(state, now, capacity, refill_per_sec))
            .unwrap_or(capacity))
    }
}
