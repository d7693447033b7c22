//! External driver seams.
//!
//! The engine talks to the LLM backend, the posting backend, and the
//! optional knowledge store through these narrow interfaces. Concrete HTTP
//! clients live outside the core; [`memory`] provides deterministic
//! in-process implementations for tests and local runs.

mod memory;

pub use memory::{MemoryKnowledge, MemoryPosting, StaticLlm};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::Credentials;

/// Errors a driver may surface.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Transient failure (network, 5xx, backend hiccup). Safe to retry.
    #[error("retryable driver error: {0}")]
    Retryable(String),

    /// Permanent failure for this request.
    #[error("driver error: {0}")]
    NonRetryable(String),

    /// The backend asked us to slow down.
    #[error("rate limited by driver")]
    RateLimited { retry_after: Option<Duration> },

    /// The posting backend rejected the text as a duplicate.
    #[error("duplicate content rejected by posting backend")]
    DuplicateContent,
}

impl DriverError {
    /// Whether the pipeline's retry loop may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Retryable(_) | DriverError::RateLimited { .. }
        )
    }

    /// Backend-signalled wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriverError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Token accounting reported by the LLM backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A finished completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Sampling parameters for a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            max_tokens: 150,
            temperature: 0.7,
        }
    }
}

/// LLM backend: completions plus text embeddings. The embedding half may be
/// served by a different deployment behind the same implementation.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn complete(&self, prompt: &str, params: &CompletionParams) -> DriverResult<Completion>;

    async fn embed(&self, text: &str) -> DriverResult<Vec<f32>>;
}

/// Receipt for a successfully published post.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub external_id: String,
}

/// Social-posting backend.
#[async_trait]
pub trait PostingDriver: Send + Sync {
    async fn publish(&self, credentials: &Credentials, text: &str)
    -> DriverResult<PublishReceipt>;

    /// Remove a published post. Operator tooling; not used by the pipeline.
    async fn delete(&self, credentials: &Credentials, external_id: &str) -> DriverResult<()>;
}

/// One retrieved context snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub id: String,
    pub content: String,
    pub similarity: f32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Optional per-tenant knowledge store. Failures here are non-fatal; the
/// pipeline proceeds without context.
#[async_trait]
pub trait KnowledgeDriver: Send + Sync {
    async fn search(
        &self,
        handle: &str,
        query: &str,
        max_results: usize,
        min_similarity: f32,
    ) -> DriverResult<Vec<KnowledgeSnippet>>;
}
