//! Tenant registry.
//!
//! Read-optimized in-memory snapshots of tenant config and last-action
//! state, reconciled periodically from the repository. The registry owns
//! the runtime activity fields (`last_acted_at`, daily counters); the
//! repository owns everything else. Activity writes are batched and
//! flushed before shutdown.

mod tenant;

pub use tenant::{Credentials, DailyCounters, Tenant};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::clock::{Clock, day_key};
use crate::repository::{Repository, RepositoryResult};

/// Activity reported by the pipeline when a work item completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobCompletion {
    pub llm_calls: u64,
    pub posts: u64,
}

pub struct TenantRegistry {
    clock: Arc<dyn Clock>,
    repository: Arc<dyn Repository>,
    tenants: DashMap<String, Tenant>,
    dirty: Mutex<HashSet<String>>,
}

impl TenantRegistry {
    pub fn new(clock: Arc<dyn Clock>, repository: Arc<dyn Repository>) -> Self {
        Self {
            clock,
            repository,
            tenants: DashMap::new(),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Initial load from the repository. Returns how many tenants were
    /// loaded.
    pub async fn load(&self) -> RepositoryResult<usize> {
        let tenants = self.repository.list_tenants().await?;
        let count = tenants.len();
        for tenant in tenants {
            self.tenants.insert(tenant.id.clone(), tenant);
        }
        info!(count, "loaded tenants");
        Ok(count)
    }

    /// Re-read tenant config from the repository, keeping the
    /// registry-owned activity fields for tenants we already track.
    /// Tenants gone from the repository are dropped.
    pub async fn reconcile(&self) -> RepositoryResult<()> {
        let fresh = self.repository.list_tenants().await?;
        let mut seen = HashSet::with_capacity(fresh.len());
        for mut incoming in fresh {
            seen.insert(incoming.id.clone());
            if let Some(existing) = self.tenants.get(&incoming.id) {
                // Our in-memory activity is at least as recent as the
                // repository's copy.
                if existing.last_acted_at > incoming.last_acted_at {
                    incoming.last_acted_at = existing.last_acted_at;
                    incoming.daily = existing.daily.clone();
                }
            }
            self.tenants.insert(incoming.id.clone(), incoming);
        }
        self.tenants.retain(|id, _| {
            let keep = seen.contains(id);
            if !keep {
                debug!(tenant_id = %id, "dropping tenant removed from repository");
            }
            keep
        });
        Ok(())
    }

    pub fn list_active(&self) -> Vec<Tenant> {
        self.tenants
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tenants.iter().filter(|entry| entry.active).count()
    }

    pub fn snapshot(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants.get(tenant_id).map(|entry| entry.value().clone())
    }

    /// Record a completed work item: bump `last_acted_at` (strictly
    /// monotonic) and the tenant-local daily counters, rolling them if the
    /// local day changed. The write-back is batched until [`flush`].
    ///
    /// [`flush`]: TenantRegistry::flush
    pub fn record_completion(&self, tenant_id: &str, outcome: JobCompletion) {
        let Some(mut entry) = self.tenants.get_mut(tenant_id) else {
            warn!(%tenant_id, "completion for unknown tenant");
            return;
        };

        let now = self.clock.now_wall();
        let acted_at = match entry.last_acted_at {
            Some(prev) if prev >= now => prev + ChronoDuration::milliseconds(1),
            _ => now,
        };
        entry.last_acted_at = Some(acted_at);

        let key = day_key(entry.timezone, now);
        entry.daily.roll(&key);
        entry.daily.llm_calls += outcome.llm_calls;
        entry.daily.posts += outcome.posts;
        drop(entry);

        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant_id.to_string());
    }

    /// Write batched activity back to the repository. Tenants whose write
    /// fails stay dirty for the next flush.
    pub async fn flush(&self) {
        let pending: Vec<String> = {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.drain().collect()
        };
        for tenant_id in pending {
            let Some(tenant) = self.snapshot(&tenant_id) else {
                continue;
            };
            let Some(acted_at) = tenant.last_acted_at else {
                continue;
            };
            if let Err(e) = self
                .repository
                .update_tenant_activity(&tenant_id, acted_at, tenant.daily.clone())
                .await
            {
                warn!(%tenant_id, error = %e, "activity write-back failed");
                self.dirty
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(tenant_id);
            }
        }
    }

    pub fn has_dirty(&self) -> bool {
        !self
            .dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}
