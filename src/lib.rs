//! # chorus-engine
//!
//! Multi-tenant bot engine that generates short social-media posts with an
//! LLM backend and publishes them on behalf of many tenants from a single
//! deployment.
//!
//! The engine drives a bounded worker pool. Each cycle selects an eligible
//! tenant under multi-dimensional quotas and posting-hour windows, acquires
//! tokens from the shared rate-limit buckets, renders a templated prompt,
//! obtains a completion (often from the semantic cache), validates it, and
//! publishes the result through the posting driver.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chorus_engine::{
//!     Engine, EngineConfig, MemoryCounterStore, MemoryPosting, MemoryRepository, StaticLlm,
//!     SystemClock,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chorus_engine::EngineError> {
//!     let clock = Arc::new(SystemClock::new());
//!     let engine = Arc::new(
//!         Engine::builder(EngineConfig::default())
//!             .clock(clock.clone())
//!             .repository(Arc::new(MemoryRepository::new()))
//!             .counter_store(Arc::new(MemoryCounterStore::new(clock)))
//!             .llm_driver(Arc::new(StaticLlm::new()))
//!             .posting_driver(Arc::new(MemoryPosting::new()))
//!             .build()?,
//!     );
//!     engine.run().await
//! }
//! ```
//!
//! Production deployments implement the [`drivers`] and [`repository`]
//! seams over their real backends and enable the `redis-store` feature for
//! a shared counter store.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod limits;
pub mod observability;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod validate;

// Re-exports for convenience
pub use cache::{CacheStats, FlightGroup, SemanticCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ConfigError, EngineConfig, KnowledgeConfig, LimitsConfig};
pub use drivers::{
    Completion, CompletionParams, DriverError, DriverResult, KnowledgeDriver, KnowledgeSnippet,
    LlmDriver, MemoryKnowledge, MemoryPosting, PostingDriver, PublishReceipt, StaticLlm,
    TokenUsage,
};
pub use engine::{Engine, EngineBuilder, EngineError, EngineState, HealthSnapshot};
pub use limits::{Admission, BucketSpec, RateLimitCoordinator};
pub use observability::{EngineMetrics, MetricsSummary, init_tracing};
pub use pipeline::{GenerationPipeline, JobOutcome, PipelineDeps};
pub use prompt::{PromptTemplate, RenderedPrompt, TemplateError, TemplateSet, prompt_hash};
pub use registry::{Credentials, DailyCounters, JobCompletion, Tenant, TenantRegistry};
pub use repository::{
    Failure, FailureKind, MemoryRepository, PostRecord, PostStatus, Repository, RepositoryError,
    StatusTransition,
};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{Claim, ClaimSet, Plan, Scheduler, WorkItem};
pub use store::{ConsumeReply, CounterStore, MemoryCounterStore, StoreError};
#[cfg(feature = "redis-store")]
pub use store::RedisCounterStore;
pub use validate::{LexiconClassifier, ResponseValidator, SafetyClassifier, Verdict};
