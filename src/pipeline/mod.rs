//! The generation pipeline.
//!
//! One work item runs the full cycle: create the post record, pass LLM
//! admission, fetch optional knowledge context, render the prompt, consult
//! the semantic cache, call the LLM (single-flight per prompt hash),
//! validate, pass posting admission (parking briefly on quota), publish,
//! and record the outcome. Each step has an explicit failure mapping; no
//! step throws through another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{FlightGroup, SemanticCache};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::drivers::{
    CompletionParams, DriverError, KnowledgeDriver, LlmDriver, PostingDriver, PublishReceipt,
};
use crate::limits::{Admission, RateLimitCoordinator};
use crate::observability::EngineMetrics;
use crate::prompt::{POST_TEMPLATE, RenderedPrompt, TemplateSet};
use crate::registry::{JobCompletion, Tenant, TenantRegistry};
use crate::repository::{
    Failure, FailureKind, PostRecord, PostStatus, Repository, RepositoryError, StatusTransition,
};
use crate::retry::{RetryError, RetryPolicy, retry_call};
use crate::scheduler::WorkItem;
use crate::validate::{ResponseValidator, Verdict};

/// Terminal result of one work item.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Published {
        post_id: Uuid,
        external_id: String,
    },
    /// Admission or a backend rate limit pushed the job out; the claim is
    /// released and the scheduler will reselect the tenant after
    /// `retry_after`. The post record, if created, stays `pending`.
    Deferred {
        retry_after: Duration,
    },
    Failed {
        post_id: Uuid,
        kind: FailureKind,
    },
    /// Shutdown interrupted the job before a terminal state.
    Cancelled,
}

/// Everything the pipeline needs, wired once at engine start.
pub struct PipelineDeps {
    pub clock: Arc<dyn Clock>,
    pub repository: Arc<dyn Repository>,
    pub registry: Arc<TenantRegistry>,
    pub coordinator: Arc<RateLimitCoordinator>,
    pub llm: Arc<dyn LlmDriver>,
    pub posting: Arc<dyn PostingDriver>,
    pub knowledge: Option<Arc<dyn KnowledgeDriver>>,
    pub cache: Arc<SemanticCache>,
    pub metrics: Arc<EngineMetrics>,
    pub config: EngineConfig,
}

enum StepError {
    Defer(Duration),
    Fail(FailureKind, String),
    Cancelled,
}

/// Race an external call against the job's cancellation handle under an
/// individual timeout, so no suspension point can hang a worker or outlive
/// shutdown. `Ok(None)` is a timeout; cancellation surfaces as
/// `StepError::Cancelled`.
async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    call: impl Future<Output = T>,
) -> Result<Option<T>, StepError> {
    tokio::select! {
        result = tokio::time::timeout(limit, call) => Ok(result.ok()),
        _ = cancel.cancelled() => Err(StepError::Cancelled),
    }
}

/// Bulleted list of recent posts for the render.
pub fn recent_block(recent: &[String]) -> String {
    if recent.is_empty() {
        return "(none)".to_string();
    }
    recent
        .iter()
        .map(|text| format!("- {text}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct GenerationPipeline {
    deps: PipelineDeps,
    templates: TemplateSet,
    validator: ResponseValidator,
    retry: RetryPolicy,
    flight: FlightGroup<String>,
    params: CompletionParams,
}

impl GenerationPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let validator = ResponseValidator::new(deps.config.post_max_len);
        Self {
            deps,
            templates: TemplateSet::new(),
            validator,
            retry: RetryPolicy::default(),
            flight: FlightGroup::new(),
            params: CompletionParams::default(),
        }
    }

    pub fn with_templates(mut self, templates: TemplateSet) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one work item to a terminal outcome. The claim inside `item` is
    /// released when the item is dropped by the caller.
    pub async fn run(&self, item: &WorkItem, cancel: &CancellationToken) -> JobOutcome {
        let tenant = &item.tenant;
        let started = self.deps.clock.now_mono();

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        // Step 1: durable record of the attempt.
        let record = PostRecord::new_pending(&tenant.id, self.deps.clock.now_wall());
        let post_id = record.id;
        let created = bounded(
            cancel,
            self.deps.config.repo_timeout,
            self.deps.repository.insert_post(record),
        )
        .await;
        match created {
            Ok(Some(Ok(()))) => {}
            Ok(outcome) => {
                let reason = match outcome {
                    Some(Err(e)) => e.to_string(),
                    _ => "timed out".to_string(),
                };
                warn!(tenant_id = %tenant.id, %reason, "could not create post record");
                self.deps.metrics.jobs_deferred.inc();
                return JobOutcome::Deferred {
                    retry_after: self.deps.config.limits.default_backoff,
                };
            }
            Err(_) => return JobOutcome::Cancelled,
        }

        // Step 2: LLM admission. A defer releases the claim with no record
        // transition.
        if let Admission::Defer(retry_after) = self.deps.coordinator.admit_llm(tenant).await {
            debug!(tenant_id = %tenant.id, ?retry_after, "llm admission deferred");
            self.deps.metrics.jobs_deferred.inc();
            return JobOutcome::Deferred { retry_after };
        }

        match self.drive(tenant, post_id, cancel).await {
            Ok(external_id) => {
                let elapsed = self.deps.clock.now_mono().saturating_sub(started);
                self.deps
                    .metrics
                    .job_latency
                    .observe(elapsed.as_secs_f64() * 1000.0);
                self.deps.metrics.jobs_published.inc();
                info!(tenant_id = %tenant.id, %post_id, %external_id, "post published");
                JobOutcome::Published {
                    post_id,
                    external_id,
                }
            }
            Err(StepError::Defer(retry_after)) => {
                self.deps.metrics.jobs_deferred.inc();
                JobOutcome::Deferred { retry_after }
            }
            Err(StepError::Fail(kind, message)) => {
                self.fail_record(post_id, kind, &message).await;
                self.deps.metrics.jobs_failed.inc();
                warn!(tenant_id = %tenant.id, %post_id, ?kind, %message, "job failed");
                JobOutcome::Failed { post_id, kind }
            }
            Err(StepError::Cancelled) => JobOutcome::Cancelled,
        }
    }

    /// Steps 3–10. Returns the external id on success.
    async fn drive(
        &self,
        tenant: &Tenant,
        post_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<String, StepError> {
        // Step 3: optional context; failures are non-fatal.
        let context = self.fetch_context(tenant, cancel).await?;

        // Step 4: render. Recent posts ride into the prompt so a tenant's
        // renders evolve as it publishes; they also feed the duplication
        // check below.
        let recent = self.recent_posts(&tenant.id, cancel).await?;
        let prompt = self.render(tenant, &context, &recent)?;

        // Steps 5–6: cache, then LLM under single-flight. The record stays
        // `pending` until a completion is in hand, so a deferral here (rate
        // limit, quota) leaves no half-walked state machine behind.
        let (text, llm_called) = self.obtain_completion(tenant, &prompt, cancel).await?;
        let text = text.trim().to_string();

        self.transition(post_id, StatusTransition::ToGenerating, cancel)
            .await?;
        self.transition(
            post_id,
            StatusTransition::ToValidating { text: text.clone() },
            cancel,
        )
        .await?;

        // Step 7: validation failures are terminal.
        if let Verdict::Fail { reason } = self.validator.validate(&text, &recent).await {
            return Err(StepError::Fail(FailureKind::Validation, reason));
        }

        // Step 8: posting admission, parked up to the configured maximum.
        self.await_post_quota(tenant, cancel).await?;

        self.transition(post_id, StatusTransition::ToPublishing, cancel)
            .await?;

        // Step 9: publish, at most once.
        let receipt = self.publish(tenant, post_id, &text).await?;

        // Step 10: published + external id land in one atomic write.
        self.transition(
            post_id,
            StatusTransition::ToPublished {
                external_id: receipt.external_id.clone(),
                published_at: self.deps.clock.now_wall(),
            },
            cancel,
        )
        .await?;

        self.deps.registry.record_completion(
            &tenant.id,
            JobCompletion {
                llm_calls: u64::from(llm_called),
                posts: 1,
            },
        );

        Ok(receipt.external_id)
    }

    async fn fetch_context(
        &self,
        tenant: &Tenant,
        cancel: &CancellationToken,
    ) -> Result<String, StepError> {
        let (Some(driver), Some(handle)) = (&self.deps.knowledge, &tenant.knowledge_handle) else {
            return Ok(String::new());
        };
        let knowledge = &self.deps.config.knowledge;
        let search = bounded(
            cancel,
            knowledge.timeout,
            driver.search(
                handle,
                &tenant.persona_prompt,
                knowledge.max_entries,
                knowledge.similarity_threshold,
            ),
        )
        .await?;
        match search {
            Some(Ok(snippets)) if snippets.is_empty() => Ok(String::new()),
            Some(Ok(snippets)) => {
                let mut block = String::from("Relevant notes:\n");
                for snippet in snippets {
                    block.push_str("- ");
                    block.push_str(&snippet.content);
                    block.push('\n');
                }
                Ok(block)
            }
            Some(Err(e)) => {
                warn!(tenant_id = %tenant.id, error = %e, "knowledge store unavailable, proceeding without context");
                Ok(String::new())
            }
            None => {
                warn!(tenant_id = %tenant.id, "knowledge search timed out, proceeding without context");
                Ok(String::new())
            }
        }
    }

    fn render(
        &self,
        tenant: &Tenant,
        context: &str,
        recent: &[String],
    ) -> Result<RenderedPrompt, StepError> {
        let template = self
            .templates
            .get(POST_TEMPLATE)
            .map_err(|e| StepError::Fail(FailureKind::Configuration, e.to_string()))?;
        let mut vars = HashMap::new();
        vars.insert("topic".to_string(), tenant.persona_prompt.clone());
        vars.insert("context".to_string(), context.to_string());
        vars.insert("recent".to_string(), recent_block(recent));
        vars.insert(
            "max_chars".to_string(),
            self.deps.config.post_max_len.to_string(),
        );
        template
            .render(&vars, &tenant.persona_prompt)
            .map_err(|e| StepError::Fail(FailureKind::Configuration, e.to_string()))
    }

    /// Cache lookup, falling back to a single-flight LLM call. Returns the
    /// completion text and whether this job actually called the driver.
    async fn obtain_completion(
        &self,
        tenant: &Tenant,
        prompt: &RenderedPrompt,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), StepError> {
        if let Some(hit) = self.deps.cache.lookup_exact(&prompt.hash) {
            self.deps.metrics.cache_hits.inc();
            debug!(tenant_id = %tenant.id, "exact cache hit");
            return Ok((hit, false));
        }

        // Exact miss: embed for the semantic level. An embedding failure
        // or timeout just skips that level; the cache is best-effort.
        let embedded = bounded(
            cancel,
            self.deps.config.llm_timeout,
            self.deps.llm.embed(&prompt.text),
        )
        .await?;
        let embedding = match embedded {
            Some(Ok(embedding)) => Some(embedding),
            Some(Err(e)) => {
                debug!(error = %e, "embedding unavailable, skipping semantic lookup");
                None
            }
            None => {
                debug!("embedding call timed out, skipping semantic lookup");
                None
            }
        };

        if let Some(embedding) = &embedding
            && let Some(hit) = self.deps.cache.lookup_similar(embedding)
        {
            self.deps.metrics.cache_hits.inc();
            debug!(tenant_id = %tenant.id, "semantic cache hit");
            return Ok((hit, false));
        }

        self.deps.cache.record_miss();
        self.deps.metrics.cache_misses.inc();

        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let llm = &self.deps.llm;
        let metrics = &self.deps.metrics;
        let retry = &self.retry;
        let timeout = self.deps.config.llm_timeout;
        let params = &self.params;
        let prompt_text = &prompt.text;

        let result = self
            .flight
            .run(&prompt.hash, || async move {
                let completion = retry_call(retry, timeout, "llm.complete", |_| {
                    llm.complete(prompt_text, params)
                })
                .await?;
                metrics.llm_calls.inc();
                metrics.llm_tokens.add(completion.usage.total() as u64);
                Ok::<_, RetryError>(completion.text)
            })
            .await;

        match result {
            Ok(text) => {
                self.deps.cache.insert(
                    prompt.hash.clone(),
                    embedding.unwrap_or_default(),
                    text.clone(),
                );
                Ok((text, true))
            }
            Err(RetryError::RateLimited { retry_after }) => {
                let wait = retry_after.unwrap_or(self.deps.config.limits.default_backoff);
                // Honour the hint so the scheduler does not reselect the
                // tenant early.
                self.deps
                    .coordinator
                    .reseed_llm_sec(&tenant.id, wait)
                    .await;
                Err(StepError::Defer(wait))
            }
            Err(RetryError::NonRetryable(e)) => {
                Err(StepError::Fail(FailureKind::Driver, e.to_string()))
            }
            Err(e @ RetryError::Exhausted { .. }) => {
                Err(StepError::Fail(FailureKind::Driver, e.to_string()))
            }
        }
    }

    async fn recent_posts(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StepError> {
        let fetched = bounded(
            cancel,
            self.deps.config.repo_timeout,
            self.deps
                .repository
                .recent_published_texts(tenant_id, self.deps.config.dup_window),
        )
        .await?;
        match fetched {
            Some(Ok(texts)) => Ok(texts),
            Some(Err(e)) => {
                warn!(%tenant_id, error = %e, "could not fetch recent posts for dedup");
                Ok(Vec::new())
            }
            None => {
                warn!(%tenant_id, "recent-posts fetch timed out");
                Ok(Vec::new())
            }
        }
    }

    /// Park the validated text until the posting quota admits it, bounded
    /// by `post_park_max`; past that the job fails with `quota_exceeded`.
    async fn await_post_quota(
        &self,
        tenant: &Tenant,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut parked = Duration::ZERO;
        loop {
            match self.deps.coordinator.admit_post(tenant).await {
                Admission::Admit => return Ok(()),
                Admission::Defer(wait) => {
                    parked += wait;
                    if parked > self.deps.config.post_park_max {
                        return Err(StepError::Fail(
                            FailureKind::QuotaExceeded,
                            format!("posting quota still exhausted after parking {parked:?}"),
                        ));
                    }
                    debug!(tenant_id = %tenant.id, ?wait, "parked awaiting posting quota");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(StepError::Cancelled),
                    }
                }
            }
        }
    }

    /// Publish with retries. Before any retry attempt, the record is
    /// re-read: if a prior attempt already landed an external id, the
    /// publish becomes a no-op, so a driver timeout cannot double-post.
    async fn publish(
        &self,
        tenant: &Tenant,
        post_id: Uuid,
        text: &str,
    ) -> Result<PublishReceipt, StepError> {
        let repository = &self.deps.repository;
        let posting = &self.deps.posting;
        let credentials = &tenant.credentials;
        let timeout = self.deps.config.post_timeout;
        let repo_timeout = self.deps.config.repo_timeout;

        let mut rate_limit_waits = 0u8;
        loop {
            let result = retry_call(&self.retry, timeout, "posting.publish", |attempt| async move {
                // The record re-read gets its own bound; a slow repository
                // must not eat the publish attempt's budget.
                if attempt > 1
                    && let Ok(Ok(Some(record))) =
                        tokio::time::timeout(repo_timeout, repository.get_post(post_id)).await
                    && record.status == PostStatus::Published
                    && let Some(external_id) = record.external_id
                {
                    return Ok(PublishReceipt { external_id });
                }
                posting.publish(credentials, text).await
            })
            .await;

            match result {
                Ok(receipt) => return Ok(receipt),
                Err(RetryError::RateLimited { retry_after }) if rate_limit_waits == 0 => {
                    rate_limit_waits += 1;
                    let wait = retry_after
                        .unwrap_or(self.deps.config.limits.default_backoff)
                        .min(self.deps.config.post_park_max);
                    debug!(tenant_id = %tenant.id, ?wait, "posting backend rate limited, waiting once");
                    tokio::time::sleep(wait).await;
                }
                Err(RetryError::RateLimited { .. }) => {
                    return Err(StepError::Fail(
                        FailureKind::Driver,
                        "posting backend rate limited".to_string(),
                    ));
                }
                Err(RetryError::NonRetryable(DriverError::DuplicateContent)) => {
                    return Err(StepError::Fail(
                        FailureKind::Validation,
                        "posting backend rejected duplicate content".to_string(),
                    ));
                }
                Err(RetryError::NonRetryable(e)) => {
                    return Err(StepError::Fail(FailureKind::Driver, e.to_string()));
                }
                Err(e @ RetryError::Exhausted { .. }) => {
                    return Err(StepError::Fail(FailureKind::Driver, e.to_string()));
                }
            }
        }
    }

    async fn transition(
        &self,
        post_id: Uuid,
        transition: StatusTransition,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let written = bounded(
            cancel,
            self.deps.config.repo_timeout,
            self.deps.repository.update_post_status(post_id, transition),
        )
        .await?;
        match written {
            Some(Ok(_)) => Ok(()),
            Some(Err(RepositoryError::Conflict { message })) => {
                // The record reached a terminal state through another path
                // (e.g. cancellation); stop without mutating further.
                debug!(%post_id, %message, "status transition rejected");
                Err(StepError::Cancelled)
            }
            Some(Err(e)) => Err(StepError::Fail(FailureKind::Internal, e.to_string())),
            None => Err(StepError::Fail(
                FailureKind::Internal,
                "repository status update timed out".to_string(),
            )),
        }
    }

    async fn fail_record(&self, post_id: Uuid, kind: FailureKind, message: &str) {
        let transition = StatusTransition::ToFailed {
            failure: Failure::new(kind, message),
        };
        let written = tokio::time::timeout(
            self.deps.config.repo_timeout,
            self.deps.repository.update_post_status(post_id, transition),
        )
        .await;
        match written {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(%post_id, error = %e, "could not mark record failed"),
            Err(_) => debug!(%post_id, "failure write timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EngineConfig, LimitsConfig};
    use crate::drivers::{MemoryKnowledge, MemoryPosting, StaticLlm};
    use crate::repository::MemoryRepository;
    use crate::scheduler::ClaimSet;
    use crate::store::MemoryCounterStore;
    use chrono_tz::UTC;

    struct Harness {
        clock: Arc<ManualClock>,
        repo: Arc<MemoryRepository>,
        registry: Arc<TenantRegistry>,
        llm: Arc<StaticLlm>,
        posting: Arc<MemoryPosting>,
        claims: ClaimSet,
        pipeline: GenerationPipeline,
    }

    async fn harness(config: EngineConfig) -> Harness {
        harness_with(config, StaticLlm::new(), None).await
    }

    async fn harness_with(
        config: EngineConfig,
        llm: StaticLlm,
        knowledge: Option<Arc<dyn KnowledgeDriver>>,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new("2024-06-01T10:00:00Z".parse().unwrap()));
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_tenant(
            Tenant::new("a", UTC)
                .with_windows(0..=23)
                .with_persona("a calm engineering voice"),
        );
        let registry = Arc::new(TenantRegistry::new(clock.clone(), repo.clone()));
        registry.load().await.unwrap();

        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let coordinator = Arc::new(RateLimitCoordinator::new(
            store,
            clock.clone(),
            config.limits.clone(),
        ));
        let cache = Arc::new(SemanticCache::new(clock.clone(), config.cache.clone()));
        let llm = Arc::new(llm);
        let posting = Arc::new(MemoryPosting::new());

        let pipeline = GenerationPipeline::new(PipelineDeps {
            clock: clock.clone(),
            repository: repo.clone(),
            registry: registry.clone(),
            coordinator,
            llm: llm.clone(),
            posting: posting.clone(),
            knowledge,
            cache,
            metrics: Arc::new(EngineMetrics::new()),
            config,
        })
        .with_retry_policy(
            RetryPolicy {
                initial: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..Default::default()
            }
            .with_jitter(0.0),
        );

        Harness {
            clock,
            repo,
            registry,
            llm,
            posting,
            claims: ClaimSet::new(),
            pipeline,
        }
    }

    impl Harness {
        fn item(&self) -> WorkItem {
            let tenant = self.registry.snapshot("a").unwrap();
            WorkItem {
                claim: self.claims.try_claim(&tenant.id).unwrap(),
                tenant,
            }
        }

        async fn run(&self) -> JobOutcome {
            let item = self.item();
            self.pipeline.run(&item, &CancellationToken::new()).await
        }

        async fn give_knowledge_handle(&self) {
            let mut tenant = self.registry.snapshot("a").unwrap();
            tenant.knowledge_handle = Some("kb-a".to_string());
            self.repo.seed_tenant(tenant);
            self.registry.reconcile().await.unwrap();
        }
    }

    #[tokio::test]
    async fn happy_path_publishes_one_post() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push_response("A fine day to ship software.");

        let outcome = h.run().await;
        let JobOutcome::Published { post_id, external_id } = outcome else {
            panic!("expected publish, got {outcome:?}");
        };

        assert_eq!(h.llm.completion_calls(), 1);
        assert_eq!(h.posting.published().len(), 1);
        assert_eq!(external_id, "post-1");

        let record = h.repo.get_post(post_id).await.unwrap().unwrap();
        assert_eq!(record.status, PostStatus::Published);
        assert_eq!(record.external_id.as_deref(), Some("post-1"));
        assert_eq!(record.text, "A fine day to ship software.");

        let tenant = h.registry.snapshot("a").unwrap();
        assert_eq!(tenant.daily.posts, 1);
        assert_eq!(tenant.daily.llm_calls, 1);
        assert!(tenant.last_acted_at.is_some());
    }

    #[tokio::test]
    async fn pacing_defers_second_job() {
        let h = harness(EngineConfig::default()).await;

        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
        h.clock.advance(Duration::from_millis(500));

        let outcome = h.run().await;
        let JobOutcome::Deferred { retry_after } = outcome else {
            panic!("expected deferral, got {outcome:?}");
        };
        assert!(retry_after >= Duration::from_millis(499));
        // The deferred attempt's record stays pending.
        let pending = h
            .repo
            .all_posts()
            .into_iter()
            .filter(|p| p.status == PostStatus::Pending)
            .count();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn validation_failure_is_terminal() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push_response("Click now to win a prize! Subscribe today!");

        let outcome = h.run().await;
        let JobOutcome::Failed { post_id, kind } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(kind, FailureKind::Validation);

        let record = h.repo.get_post(post_id).await.unwrap().unwrap();
        assert_eq!(record.status, PostStatus::Failed);
        assert_eq!(record.failure.unwrap().kind, FailureKind::Validation);
        assert!(h.posting.published().is_empty());
    }

    #[tokio::test]
    async fn llm_rate_limit_defers_and_reseeds() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push_failure(DriverError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        });

        let outcome = h.run().await;
        let JobOutcome::Deferred { retry_after } = outcome else {
            panic!("expected deferral, got {outcome:?}");
        };
        assert_eq!(retry_after, Duration::from_secs(2));

        // Record remains pending and nothing was published.
        let posts = h.repo.all_posts();
        assert!(posts.iter().all(|p| p.status == PostStatus::Pending));
        assert!(h.posting.published().is_empty());

        // Even after the natural 1 s pacing refill, the reseeded bucket
        // still blocks; it opens after the full hint.
        h.clock.advance(Duration::from_secs(1));
        assert!(matches!(h.run().await, JobOutcome::Deferred { .. }));
        h.clock.advance(Duration::from_secs(1));
        h.llm.push_response("Back in business after the backoff.");
        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn transient_llm_errors_are_retried() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push_failure(DriverError::Retryable("blip".into()));
        h.llm.push_failure(DriverError::Retryable("blip".into()));
        h.llm.push_response("Third time lucky.");

        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_driver_kind() {
        let h = harness(EngineConfig::default()).await;
        for _ in 0..3 {
            h.llm.push_failure(DriverError::Retryable("down".into()));
        }

        let outcome = h.run().await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: FailureKind::Driver,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cache_answers_identical_prompt_without_llm() {
        let h = harness(EngineConfig::default()).await;
        // The completion fails validation, so nothing is published and the
        // tenant's next render is identical.
        h.llm.push_response("Click now to win a prize! Subscribe!");

        let first = h.run().await;
        assert!(matches!(
            first,
            JobOutcome::Failed {
                kind: FailureKind::Validation,
                ..
            }
        ));
        assert_eq!(h.llm.completion_calls(), 1);

        // The rerun renders the same prompt hash; the cache answers and the
        // driver is not called again.
        h.clock.advance(Duration::from_secs(2));
        let second = h.run().await;
        assert_eq!(h.llm.completion_calls(), 1, "cache must answer the rerun");
        assert!(matches!(
            second,
            JobOutcome::Failed {
                kind: FailureKind::Validation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn published_posts_change_the_next_render() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push_response("First thought of the morning.");
        assert!(matches!(h.run().await, JobOutcome::Published { .. }));

        // The recent-posts block now differs, so the second run misses the
        // cache and generates fresh text.
        h.clock.advance(Duration::from_secs(2));
        h.llm.push_response("Second thought of the afternoon.");
        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
        assert_eq!(h.llm.completion_calls(), 2);
    }

    #[tokio::test]
    async fn post_quota_park_expires_to_quota_exceeded() {
        let config = EngineConfig {
            post_park_max: Duration::from_millis(50),
            limits: LimitsConfig {
                client_daily_posts: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = harness(config).await;
        h.llm.push_response("First post takes the daily slot.");
        assert!(matches!(h.run().await, JobOutcome::Published { .. }));

        h.clock.advance(Duration::from_secs(2));
        h.llm.push_response("Second post has nowhere to go.");
        let outcome = h.run().await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: FailureKind::QuotaExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn publish_retry_after_timeout_does_not_double_post() {
        let h = harness(EngineConfig::default()).await;
        h.posting
            .push_failure(DriverError::Retryable("socket closed mid-response".into()));

        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
        // Two driver calls (one failed), one published post.
        assert_eq!(h.posting.publish_calls(), 2);
        assert_eq!(h.posting.published().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_content_from_backend_fails_validation_kind() {
        let h = harness(EngineConfig::default()).await;
        h.posting.push_failure(DriverError::DuplicateContent);

        let outcome = h.run().await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                kind: FailureKind::Validation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn knowledge_outage_is_non_fatal() {
        let knowledge = Arc::new(MemoryKnowledge::new());
        knowledge.push_failure(DriverError::Retryable("kb down".into()));

        let mut config = EngineConfig::default();
        config.knowledge.similarity_threshold = 0.1;
        let h = harness_with(config, StaticLlm::new(), Some(knowledge)).await;

        h.give_knowledge_handle().await;
        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
    }

    /// Knowledge driver whose search never resolves.
    struct HangingKnowledge;

    #[async_trait::async_trait]
    impl KnowledgeDriver for HangingKnowledge {
        async fn search(
            &self,
            _handle: &str,
            _query: &str,
            _max_results: usize,
            _min_similarity: f32,
        ) -> crate::drivers::DriverResult<Vec<crate::drivers::KnowledgeSnippet>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn hanging_knowledge_driver_is_timed_out() {
        let mut config = EngineConfig::default();
        config.knowledge.timeout = Duration::from_millis(20);
        let h = harness_with(config, StaticLlm::new(), Some(Arc::new(HangingKnowledge))).await;

        h.give_knowledge_handle().await;
        // The search times out and the job proceeds without context.
        assert!(matches!(h.run().await, JobOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn cancellation_unblocks_stalled_knowledge_call() {
        // Default 10 s knowledge timeout: only cancellation can unstick
        // this job promptly.
        let h = harness_with(
            EngineConfig::default(),
            StaticLlm::new(),
            Some(Arc::new(HangingKnowledge)),
        )
        .await;
        h.give_knowledge_handle().await;

        let cancel = CancellationToken::new();
        let item = h.item();
        let (outcome, _) = tokio::join!(h.pipeline.run(&item, &cancel), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        assert!(matches!(outcome, JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_before_start_leaves_no_record() {
        let h = harness(EngineConfig::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let item = h.item();
        let outcome = h.pipeline.run(&item, &cancel).await;
        assert!(matches!(outcome, JobOutcome::Cancelled));
        assert!(h.repo.all_posts().is_empty());
    }
}
