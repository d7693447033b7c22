//! In-memory repository backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::post::{PostRecord, StatusTransition};
use super::{Repository, RepositoryError, RepositoryResult};
use crate::registry::{DailyCounters, Tenant};

/// Repository backed by process memory. Suitable for tests and
/// single-process deployments; state does not survive a restart.
#[derive(Default)]
pub struct MemoryRepository {
    tenants: DashMap<String, Tenant>,
    posts: DashMap<Uuid, PostRecord>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tenant synchronously, for test setup.
    pub fn seed_tenant(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    /// Drop a tenant synchronously, for test setup.
    pub fn remove_tenant(&self, id: &str) {
        self.tenants.remove(id);
    }

    /// Snapshot of every post record, for test assertions.
    pub fn all_posts(&self) -> Vec<PostRecord> {
        self.posts.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_tenants(&self) -> RepositoryResult<Vec<Tenant>> {
        Ok(self.tenants.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_tenant(&self, id: &str) -> RepositoryResult<Option<Tenant>> {
        Ok(self.tenants.get(id).map(|e| e.value().clone()))
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> RepositoryResult<()> {
        self.tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    async fn update_tenant_activity(
        &self,
        id: &str,
        last_acted_at: DateTime<Utc>,
        daily: DailyCounters,
    ) -> RepositoryResult<()> {
        let mut entry = self
            .tenants
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })?;
        entry.last_acted_at = Some(last_acted_at);
        entry.daily = daily;
        Ok(())
    }

    async fn insert_post(&self, record: PostRecord) -> RepositoryResult<()> {
        self.posts.insert(record.id, record);
        Ok(())
    }

    async fn get_post(&self, id: Uuid) -> RepositoryResult<Option<PostRecord>> {
        Ok(self.posts.get(&id).map(|e| e.value().clone()))
    }

    async fn update_post_status(
        &self,
        id: Uuid,
        transition: StatusTransition,
    ) -> RepositoryResult<PostRecord> {
        // The DashMap entry guard holds the shard lock, so check-and-write
        // is atomic per record.
        let mut entry = self
            .posts
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })?;
        let target = transition.target();
        if !entry.status.can_transition(target) {
            return Err(RepositoryError::Conflict {
                message: format!("illegal transition {:?} -> {:?}", entry.status, target),
            });
        }
        entry.apply(&transition);
        Ok(entry.clone())
    }

    async fn recent_published_texts(
        &self,
        tenant_id: &str,
        n: usize,
    ) -> RepositoryResult<Vec<String>> {
        let mut published: Vec<(DateTime<Utc>, String)> = self
            .posts
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter_map(|e| e.published_at.map(|at| (at, e.text.clone())))
            .collect();
        published.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(published.into_iter().take(n).map(|(_, text)| text).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::post::{Failure, FailureKind, PostStatus};
    use chrono::TimeZone;
    use chrono_tz::UTC;

    fn pending_post(tenant: &str) -> PostRecord {
        PostRecord::new_pending(tenant, Utc::now())
    }

    #[tokio::test]
    async fn upsert_and_list_tenants() {
        let repo = MemoryRepository::new();
        repo.upsert_tenant(Tenant::new("a", UTC)).await.unwrap();
        repo.upsert_tenant(Tenant::new("b", UTC)).await.unwrap();
        assert_eq!(repo.list_tenants().await.unwrap().len(), 2);
        assert!(repo.get_tenant("a").await.unwrap().is_some());
        assert!(repo.get_tenant("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_updates_walk_the_machine() {
        let repo = MemoryRepository::new();
        let post = pending_post("a");
        let id = post.id;
        repo.insert_post(post).await.unwrap();

        repo.update_post_status(id, StatusTransition::ToGenerating)
            .await
            .unwrap();
        let record = repo
            .update_post_status(
                id,
                StatusTransition::ToValidating {
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(record.status, PostStatus::Validating);
        assert_eq!(record.text, "hello");
    }

    #[tokio::test]
    async fn illegal_transition_is_a_conflict() {
        let repo = MemoryRepository::new();
        let post = pending_post("a");
        let id = post.id;
        repo.insert_post(post).await.unwrap();

        let result = repo
            .update_post_status(
                id,
                StatusTransition::ToPublished {
                    external_id: "x".into(),
                    published_at: Utc::now(),
                },
            )
            .await;
        assert!(matches!(result, Err(RepositoryError::Conflict { .. })));

        // The record is unchanged after the rejected write.
        let record = repo.get_post(id).await.unwrap().unwrap();
        assert_eq!(record.status, PostStatus::Pending);
        assert!(record.external_id.is_none());
    }

    #[tokio::test]
    async fn failed_is_terminal() {
        let repo = MemoryRepository::new();
        let post = pending_post("a");
        let id = post.id;
        repo.insert_post(post).await.unwrap();

        repo.update_post_status(
            id,
            StatusTransition::ToFailed {
                failure: Failure::new(FailureKind::Validation, "too long"),
            },
        )
        .await
        .unwrap();

        assert!(
            repo.update_post_status(id, StatusTransition::ToGenerating)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn recent_published_is_newest_first_and_bounded() {
        let repo = MemoryRepository::new();
        for (i, hour) in [9u32, 11, 10].iter().enumerate() {
            let mut post = pending_post("a");
            post.text = format!("post-{i}");
            post.status = PostStatus::Published;
            post.published_at = Some(Utc.with_ymd_and_hms(2024, 6, 1, *hour, 0, 0).unwrap());
            repo.insert_post(post).await.unwrap();
        }
        // A different tenant's post is excluded.
        let mut other = pending_post("b");
        other.status = PostStatus::Published;
        other.published_at = Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        repo.insert_post(other).await.unwrap();

        let texts = repo.recent_published_texts("a", 2).await.unwrap();
        assert_eq!(texts, vec!["post-1".to_string(), "post-2".to_string()]);
    }
}
