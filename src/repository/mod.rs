//! Durable storage seam.
//!
//! The repository owns durable truth for tenants and post records. The
//! engine consumes this narrow interface; concrete backends live outside
//! the core. [`MemoryRepository`] backs tests and single-process use.

mod memory;
mod post;

pub use memory::MemoryRepository;
pub use post::{Failure, FailureKind, PostRecord, PostStatus, StatusTransition};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::{DailyCounters, Tenant};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {id}")]
    NotFound { id: String },

    /// A conditional update was rejected, e.g. an illegal status
    /// transition.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The backing store is unreachable. Transient.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_tenants(&self) -> RepositoryResult<Vec<Tenant>>;

    async fn get_tenant(&self, id: &str) -> RepositoryResult<Option<Tenant>>;

    async fn upsert_tenant(&self, tenant: Tenant) -> RepositoryResult<()>;

    /// Write back the registry-owned activity fields for one tenant.
    async fn update_tenant_activity(
        &self,
        id: &str,
        last_acted_at: DateTime<Utc>,
        daily: DailyCounters,
    ) -> RepositoryResult<()>;

    async fn insert_post(&self, record: PostRecord) -> RepositoryResult<()>;

    async fn get_post(&self, id: Uuid) -> RepositoryResult<Option<PostRecord>>;

    /// Conditionally apply `transition`. Rejects edges the status machine
    /// does not allow with [`RepositoryError::Conflict`]; the check and the
    /// write are one atomic step. Returns the updated record.
    async fn update_post_status(
        &self,
        id: Uuid,
        transition: StatusTransition,
    ) -> RepositoryResult<PostRecord>;

    /// Texts of the tenant's most recent published posts, newest first.
    async fn recent_published_texts(
        &self,
        tenant_id: &str,
        n: usize,
    ) -> RepositoryResult<Vec<String>>;
}
