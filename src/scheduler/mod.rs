//! Tenant selection.
//!
//! A cooperative ticker: each call to [`Scheduler::plan`] yields the work
//! items the pool should run now, plus the instant to wake up if nothing is
//! runnable. Selection is least-recently-acted-first with a stable id-hash
//! tie-break, and is deterministic given identical inputs. A claim per
//! dispatched tenant guarantees at-most-one in-flight job per tenant.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::clock::{Clock, day_key, in_posting_window, next_local_midnight, next_window_open};
use crate::config::LimitsConfig;
use crate::registry::{Tenant, TenantRegistry};

/// Claims currently held, one per in-flight tenant.
#[derive(Clone, Default)]
pub struct ClaimSet {
    inner: Arc<DashMap<String, ()>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the claim for `tenant_id`, or `None` if one is already held.
    pub fn try_claim(&self, tenant_id: &str) -> Option<Claim> {
        match self.inner.entry(tenant_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Claim {
                    set: self.inner.clone(),
                    tenant_id: tenant_id.to_string(),
                })
            }
        }
    }

    pub fn is_claimed(&self, tenant_id: &str) -> bool {
        self.inner.contains_key(tenant_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Exclusive in-memory marker preventing re-selection of a tenant while a
/// work item is in flight. Released on drop.
pub struct Claim {
    set: Arc<DashMap<String, ()>>,
    tenant_id: String,
}

impl Claim {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set.remove(&self.tenant_id);
    }
}

/// One dispatched unit: attempt a generation-and-publish cycle for one
/// tenant. Carries the claim.
pub struct WorkItem {
    pub tenant: Tenant,
    pub claim: Claim,
}

/// Outcome of one scheduler tick.
pub struct Plan {
    pub items: Vec<WorkItem>,
    /// How long to sleep when `items` is empty; `None` means nothing is
    /// scheduled at all (no active tenants with windows).
    pub next_wakeup: Option<Duration>,
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    registry: Arc<TenantRegistry>,
    claims: ClaimSet,
    limits: LimitsConfig,
    reconcile_interval: Duration,
}

fn id_hash(id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        registry: Arc<TenantRegistry>,
        limits: LimitsConfig,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            clock,
            registry,
            claims: ClaimSet::new(),
            limits,
            reconcile_interval,
        }
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    fn under_daily_limits(&self, tenant: &Tenant, now: DateTime<Utc>) -> bool {
        let key = day_key(tenant.timezone, now);
        if tenant.daily.day_key != key {
            // Counters from a previous local day; the registry resets them
            // on the next completion.
            return true;
        }
        tenant.daily.llm_calls < self.limits.client_daily_llm
            && tenant.daily.posts < self.limits.client_daily_posts
    }

    /// Produce up to `max_items` work items, claiming each selected
    /// tenant. When nothing is eligible, `next_wakeup` is the earliest of:
    /// the next window opening, the next tenant-local midnight (daily
    /// reset), and the repository poll interval.
    pub fn plan(&self, max_items: usize) -> Plan {
        let now = self.clock.now_wall();
        let active = self.registry.list_active();

        let mut eligible: Vec<&Tenant> = active
            .iter()
            .filter(|t| in_posting_window(&t.posting_windows, t.timezone, now))
            .filter(|t| self.under_daily_limits(t, now))
            .filter(|t| !self.claims.is_claimed(&t.id))
            .collect();

        // Least recently acted first; never-acted tenants lead. The id
        // hash breaks ties deterministically.
        eligible.sort_by_key(|t| (t.last_acted_at, id_hash(&t.id)));

        let mut items = Vec::new();
        for tenant in &eligible {
            if items.len() >= max_items {
                break;
            }
            if let Some(claim) = self.claims.try_claim(&tenant.id) {
                trace!(tenant_id = %tenant.id, "dispatching work item");
                items.push(WorkItem {
                    tenant: (*tenant).clone(),
                    claim,
                });
            }
        }

        let next_wakeup = if eligible.len() > items.len() {
            // More work than pool capacity this tick; come back at once.
            Some(Duration::ZERO)
        } else {
            self.next_wakeup(&active, now)
        };

        Plan { items, next_wakeup }
    }

    fn next_wakeup(&self, active: &[Tenant], now: DateTime<Utc>) -> Option<Duration> {
        if active.is_empty() {
            return Some(self.reconcile_interval);
        }
        let mut earliest = self.reconcile_interval;
        for tenant in active {
            let candidate = if !in_posting_window(&tenant.posting_windows, tenant.timezone, now) {
                next_window_open(&tenant.posting_windows, tenant.timezone, now)
                    .map(|open| (open - now).to_std().unwrap_or(Duration::ZERO))
            } else if !self.under_daily_limits(tenant, now) {
                Some(
                    (next_local_midnight(tenant.timezone, now) - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                )
            } else {
                // Eligible but claimed; the completion will retrigger us.
                None
            };
            if let Some(wait) = candidate {
                earliest = earliest.min(wait);
            }
        }
        Some(earliest)
    }
}
