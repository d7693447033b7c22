//! Shared counter store backing the token buckets.
//!
//! Bucket state lives in a durable key-value store so quota decisions are
//! atomic across concurrent workers. Refill is continuous:
//! `tokens = min(capacity, tokens + elapsed × rate)`. The in-memory store
//! is always available; the Redis store sits behind the `redis-store`
//! feature the way the teacher gates its Redis session backend.

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

pub use memory::MemoryCounterStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisCounterStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is unreachable or timed out. Transient; callers
    /// defer rather than fail.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of one atomic consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeReply {
    /// Whether the bucket had at least `cost` tokens after refill.
    pub ok: bool,
    /// Tokens left after the (possibly rejected) consume.
    pub remaining: f64,
    /// If rejected, how long until the bucket holds `cost` tokens.
    pub retry_after: Duration,
}

/// Atomic bucket operations over a shared counter store.
///
/// Every method is atomic per key. A fresh key starts as a full bucket.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Refill, then try to take `cost` tokens.
    async fn consume(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> StoreResult<ConsumeReply>;

    /// Re-add `amount` tokens, clamped to `capacity`. Best effort: a no-op
    /// for keys the store no longer holds.
    async fn refund(&self, key: &str, amount: f64, capacity: f64) -> StoreResult<()>;

    /// Re-seed the bucket so a unit consume cannot succeed for
    /// `unavailable_for`. Used to honour backend `retry_after` hints; never
    /// adds tokens.
    async fn penalize(
        &self,
        key: &str,
        unavailable_for: Duration,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Refreshed token count without consuming. Health surface only.
    async fn remaining(&self, key: &str, capacity: f64, refill_per_sec: f64) -> StoreResult<f64>;
}
