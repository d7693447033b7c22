//! Multi-bucket admission control.
//!
//! A decision site composes several buckets (global daily, per-tenant
//! daily, per-tenant pacing) into one admit-or-defer outcome. Buckets are
//! consumed coarsest first; when a later bucket rejects, the earlier
//! consumes are refunded best-effort so rejected attempts do not starve
//! other tenants.
//!
//! Pacing buckets refill continuously. Daily buckets are countdowns keyed
//! by the calendar day (tenant-local for per-tenant buckets, UTC for the
//! global one): the key rolls at midnight, a fresh day starts full, and
//! stale days self-reclaim through the store TTL. A daily rejection defers
//! until the next rollover.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::clock::{Clock, day_key, next_local_midnight};
use crate::config::LimitsConfig;
use crate::registry::Tenant;
use crate::store::{CounterStore, StoreError};

/// Daily buckets expire after two days so stale day keys self-reclaim.
const DAILY_TTL: Duration = Duration::from_secs(48 * 3600);
/// Pacing buckets are tiny and refill fast; an hour of retention is ample.
const PACING_TTL: Duration = Duration::from_secs(3600);

/// One bucket in an admission decision.
#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub key: String,
    pub cost: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub ttl: Duration,
    /// For day-keyed buckets, the UTC instant a fresh bucket appears.
    /// Rejections defer until then.
    pub rollover: Option<DateTime<Utc>>,
}

impl BucketSpec {
    /// Hard per-tenant LLM pacing: capacity 1, so grants are at least
    /// `1/per_sec` apart.
    pub fn llm_sec(tenant_id: &str, per_sec: f64) -> Self {
        Self {
            key: format!("llm:sec:{tenant_id}"),
            cost: 1.0,
            capacity: 1.0,
            refill_per_sec: per_sec,
            ttl: PACING_TTL,
            rollover: None,
        }
    }

    pub fn llm_day(tenant_id: &str, tz: Tz, now: DateTime<Utc>, daily_limit: u64) -> Self {
        Self {
            key: format!("llm:day:{tenant_id}:{}", day_key(tz, now)),
            cost: 1.0,
            capacity: daily_limit as f64,
            refill_per_sec: 0.0,
            ttl: DAILY_TTL,
            rollover: Some(next_local_midnight(tz, now)),
        }
    }

    /// Deployment-wide daily bucket, keyed by the UTC date.
    pub fn llm_day_global(now: DateTime<Utc>, daily_limit: u64) -> Self {
        Self {
            key: format!("llm:day:global:{}", day_key(chrono_tz::UTC, now)),
            cost: 1.0,
            capacity: daily_limit as f64,
            refill_per_sec: 0.0,
            ttl: DAILY_TTL,
            rollover: Some(next_local_midnight(chrono_tz::UTC, now)),
        }
    }

    pub fn post_day(tenant_id: &str, tz: Tz, now: DateTime<Utc>, daily_limit: u64) -> Self {
        Self {
            key: format!("post:day:{tenant_id}:{}", day_key(tz, now)),
            cost: 1.0,
            capacity: daily_limit as f64,
            refill_per_sec: 0.0,
            ttl: DAILY_TTL,
            rollover: Some(next_local_midnight(tz, now)),
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Defer(Duration),
}

impl Admission {
    pub fn is_admit(&self) -> bool {
        matches!(self, Admission::Admit)
    }
}

/// Composes bucket consumes into admission decisions.
pub struct RateLimitCoordinator {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    limits: LimitsConfig,
}

impl RateLimitCoordinator {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, limits: LimitsConfig) -> Self {
        Self {
            store,
            clock,
            limits,
        }
    }

    /// Buckets guarding one LLM call for `tenant`, coarsest first.
    pub fn llm_buckets(&self, tenant: &Tenant) -> Vec<BucketSpec> {
        let now = self.clock.now_wall();
        vec![
            BucketSpec::llm_day_global(now, self.limits.global_daily_llm),
            BucketSpec::llm_day(
                &tenant.id,
                tenant.timezone,
                now,
                self.limits.client_daily_llm,
            ),
            BucketSpec::llm_sec(&tenant.id, self.limits.client_llm_per_sec),
        ]
    }

    /// Buckets guarding one publish for `tenant`.
    pub fn post_buckets(&self, tenant: &Tenant) -> Vec<BucketSpec> {
        vec![BucketSpec::post_day(
            &tenant.id,
            tenant.timezone,
            self.clock.now_wall(),
            self.limits.client_daily_posts,
        )]
    }

    pub async fn admit_llm(&self, tenant: &Tenant) -> Admission {
        self.admit(&self.llm_buckets(tenant)).await
    }

    pub async fn admit_post(&self, tenant: &Tenant) -> Admission {
        self.admit(&self.post_buckets(tenant)).await
    }

    /// Consume every bucket in order; on the first rejection, refund what
    /// was already taken and defer.
    pub async fn admit(&self, buckets: &[BucketSpec]) -> Admission {
        for (index, bucket) in buckets.iter().enumerate() {
            let reply = self
                .store
                .consume(
                    &bucket.key,
                    bucket.cost,
                    bucket.capacity,
                    bucket.refill_per_sec,
                    bucket.ttl,
                )
                .await;
            match reply {
                Ok(reply) if reply.ok => {}
                Ok(reply) => {
                    debug!(
                        key = %bucket.key,
                        remaining = reply.remaining,
                        "bucket rejected admission"
                    );
                    self.refund_consumed(&buckets[..index]).await;
                    return Admission::Defer(self.rejection_wait(bucket, reply.retry_after));
                }
                Err(StoreError::Unavailable(message)) => {
                    warn!(key = %bucket.key, %message, "counter store unavailable");
                    self.refund_consumed(&buckets[..index]).await;
                    return Admission::Defer(self.limits.default_backoff);
                }
            }
        }
        Admission::Admit
    }

    fn rejection_wait(&self, bucket: &BucketSpec, retry_after: Duration) -> Duration {
        if let Some(rollover) = bucket.rollover {
            // Day-keyed bucket: a fresh one appears at the rollover.
            return (rollover - self.clock.now_wall())
                .to_std()
                .unwrap_or(self.limits.default_backoff);
        }
        if retry_after.is_zero() {
            self.limits.default_backoff
        } else {
            retry_after
        }
    }

    /// Honour a backend `retry_after` hint by draining the tenant's pacing
    /// bucket for that long.
    pub async fn reseed_llm_sec(&self, tenant_id: &str, retry_after: Duration) {
        let bucket = BucketSpec::llm_sec(tenant_id, self.limits.client_llm_per_sec);
        if let Err(e) = self
            .store
            .penalize(&bucket.key, retry_after, bucket.refill_per_sec, bucket.ttl)
            .await
        {
            warn!(key = %bucket.key, error = %e, "failed to reseed pacing bucket");
        }
    }

    /// Refreshed token counts for the health surface: the global bucket
    /// plus the daily buckets of each listed tenant.
    pub async fn remaining_by_key(&self, tenants: &[Tenant]) -> Vec<(String, f64)> {
        let now = self.clock.now_wall();
        let mut specs = vec![BucketSpec::llm_day_global(now, self.limits.global_daily_llm)];
        for tenant in tenants {
            specs.push(BucketSpec::llm_day(
                &tenant.id,
                tenant.timezone,
                now,
                self.limits.client_daily_llm,
            ));
            specs.push(BucketSpec::post_day(
                &tenant.id,
                tenant.timezone,
                now,
                self.limits.client_daily_posts,
            ));
        }
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Ok(remaining) = self
                .store
                .remaining(&spec.key, spec.capacity, spec.refill_per_sec)
                .await
            {
                out.push((spec.key, remaining));
            }
        }
        out
    }

    /// Whether the global daily bucket still holds a token. The scheduler
    /// consults this before draining work into the pool.
    pub async fn global_llm_available(&self) -> bool {
        let spec = BucketSpec::llm_day_global(self.clock.now_wall(), self.limits.global_daily_llm);
        match self
            .store
            .remaining(&spec.key, spec.capacity, spec.refill_per_sec)
            .await
        {
            Ok(remaining) => remaining >= 1.0,
            // Unknown store state defers the decision to admission time.
            Err(_) => true,
        }
    }

    async fn refund_consumed(&self, consumed: &[BucketSpec]) {
        for bucket in consumed {
            if let Err(e) = self
                .store
                .refund(&bucket.key, bucket.cost, bucket.capacity)
                .await
            {
                debug!(key = %bucket.key, error = %e, "refund failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{ConsumeReply, MemoryCounterStore, StoreResult};
    use async_trait::async_trait;
    use chrono_tz::UTC;

    fn coordinator(limits: LimitsConfig) -> (Arc<ManualClock>, RateLimitCoordinator) {
        let clock = Arc::new(ManualClock::new("2024-06-01T10:00:00Z".parse().unwrap()));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        (
            clock.clone(),
            RateLimitCoordinator::new(store, clock, limits),
        )
    }

    fn tenant(id: &str) -> Tenant {
        Tenant::new(id, UTC)
    }

    #[tokio::test]
    async fn admits_when_all_buckets_have_tokens() {
        let (_, coord) = coordinator(LimitsConfig::default());
        assert!(coord.admit_llm(&tenant("a")).await.is_admit());
    }

    #[tokio::test]
    async fn pacing_defers_second_request() {
        let (clock, coord) = coordinator(LimitsConfig::default());
        let t = tenant("a");
        assert!(coord.admit_llm(&t).await.is_admit());

        clock.advance(Duration::from_millis(500));
        match coord.admit_llm(&t).await {
            Admission::Defer(wait) => {
                assert!(wait >= Duration::from_millis(499), "got {wait:?}");
                assert!(wait <= Duration::from_millis(501), "got {wait:?}");
            }
            Admission::Admit => panic!("second request within a second must defer"),
        }
    }

    #[tokio::test]
    async fn rejection_refunds_outer_buckets() {
        let (clock, coord) = coordinator(LimitsConfig {
            global_daily_llm: 2,
            ..Default::default()
        });
        let t = tenant("a");
        assert!(coord.admit_llm(&t).await.is_admit());

        // Pacing rejects; the global and per-tenant day consumes are
        // returned, so the global bucket still holds one token.
        assert!(!coord.admit_llm(&t).await.is_admit());
        assert!(coord.global_llm_available().await);

        clock.advance(Duration::from_secs(1));
        assert!(coord.admit_llm(&t).await.is_admit());
    }

    #[tokio::test]
    async fn exhausted_global_blocks_every_tenant() {
        let (_, coord) = coordinator(LimitsConfig {
            global_daily_llm: 1,
            ..Default::default()
        });
        assert!(coord.admit_llm(&tenant("a")).await.is_admit());
        assert!(!coord.admit_llm(&tenant("b")).await.is_admit());
        assert!(!coord.global_llm_available().await);
    }

    #[tokio::test]
    async fn post_bucket_enforces_daily_cap() {
        let (_, coord) = coordinator(LimitsConfig {
            client_daily_posts: 1,
            ..Default::default()
        });
        assert!(coord.admit_post(&tenant("a")).await.is_admit());
        assert!(!coord.admit_post(&tenant("a")).await.is_admit());
        // A different tenant has its own bucket.
        assert!(coord.admit_post(&tenant("b")).await.is_admit());
    }

    #[tokio::test]
    async fn daily_rejection_defers_to_local_midnight() {
        let (_, coord) = coordinator(LimitsConfig {
            client_daily_posts: 1,
            ..Default::default()
        });
        let t = tenant("a");
        assert!(coord.admit_post(&t).await.is_admit());
        match coord.admit_post(&t).await {
            // 10:00 UTC to midnight is 14 hours.
            Admission::Defer(wait) => assert_eq!(wait, Duration::from_secs(14 * 3600)),
            Admission::Admit => panic!("exhausted daily bucket must defer"),
        }
    }

    #[tokio::test]
    async fn daily_bucket_resets_at_local_midnight() {
        let (clock, coord) = coordinator(LimitsConfig {
            client_daily_posts: 1,
            ..Default::default()
        });
        let t = tenant("a");
        assert!(coord.admit_post(&t).await.is_admit());
        assert!(!coord.admit_post(&t).await.is_admit());

        // Cross midnight: the day key rolls, so a fresh bucket admits.
        clock.advance(Duration::from_secs(15 * 3600));
        assert!(coord.admit_post(&t).await.is_admit());
    }

    #[tokio::test]
    async fn reseed_honours_backend_hint() {
        let (clock, coord) = coordinator(LimitsConfig::default());
        let t = tenant("a");
        coord.reseed_llm_sec("a", Duration::from_secs(2)).await;

        assert!(!coord.admit_llm(&t).await.is_admit());
        clock.advance(Duration::from_secs(1));
        assert!(!coord.admit_llm(&t).await.is_admit());
        clock.advance(Duration::from_secs(1));
        assert!(coord.admit_llm(&t).await.is_admit());
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn consume(
            &self,
            _key: &str,
            _cost: f64,
            _capacity: f64,
            _refill_per_sec: f64,
            _ttl: Duration,
        ) -> StoreResult<ConsumeReply> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn refund(&self, _key: &str, _amount: f64, _capacity: f64) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn penalize(
            &self,
            _key: &str,
            _unavailable_for: Duration,
            _refill_per_sec: f64,
            _ttl: Duration,
        ) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn remaining(
            &self,
            _key: &str,
            _capacity: f64,
            _refill_per_sec: f64,
        ) -> StoreResult<f64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn store_outage_maps_to_default_backoff() {
        let limits = LimitsConfig {
            default_backoff: Duration::from_secs(7),
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new("2024-06-01T10:00:00Z".parse().unwrap()));
        let coord = RateLimitCoordinator::new(Arc::new(DownStore), clock, limits);
        assert_eq!(
            coord.admit_llm(&tenant("a")).await,
            Admission::Defer(Duration::from_secs(7))
        );
    }

    #[tokio::test]
    async fn quota_conformance_over_a_second() {
        // At most one llm:sec grant lands inside any one-second window.
        let (clock, coord) = coordinator(LimitsConfig::default());
        let t = tenant("a");
        let mut admitted = 0;
        for _ in 0..20 {
            if coord.admit_llm(&t).await.is_admit() {
                admitted += 1;
            }
            clock.advance(Duration::from_millis(50));
        }
        // 20 × 50 ms = 1 s of elapsed time: the initial grant plus one
        // refill.
        assert!(admitted <= 2, "admitted {admitted} in one second");
    }

    #[tokio::test]
    async fn daily_llm_cap_holds_within_a_day() {
        let (clock, coord) = coordinator(LimitsConfig {
            client_daily_llm: 5,
            global_daily_llm: 1000,
            ..Default::default()
        });
        let t = tenant("a");
        let mut admitted = 0;
        // Spread attempts across the rest of the local day.
        for _ in 0..13 {
            if coord.admit_llm(&t).await.is_admit() {
                admitted += 1;
            }
            clock.advance(Duration::from_secs(3600));
        }
        assert_eq!(admitted, 5);
    }
}
