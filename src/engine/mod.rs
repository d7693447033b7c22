//! Engine loop and worker pool.
//!
//! The engine owns every component, drives the scheduler tick loop, feeds a
//! bounded worker pool over a rendezvous channel, and runs the registry
//! reconciler and cache sweeper. Shutdown is two-phase: drain in-flight
//! jobs within the grace period, then abort what remains — including the
//! tracked claim-holder tasks parked on deferred jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheStats, SemanticCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::drivers::{KnowledgeDriver, LlmDriver, PostingDriver};
use crate::limits::RateLimitCoordinator;
use crate::observability::{EngineMetrics, MetricsSummary};
use crate::pipeline::{GenerationPipeline, JobOutcome, PipelineDeps};
use crate::registry::TenantRegistry;
use crate::repository::Repository;
use crate::scheduler::{Scheduler, WorkItem};
use crate::store::CounterStore;
use crate::validate::ResponseValidator;

/// Idle poll when the pool is saturated or the global bucket is dry.
const BUSY_TICK: Duration = Duration::from_millis(100);

/// Errors that abort engine start. Everything here is fatal; transient
/// trouble after start is handled inside the components.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("missing required component: {0}")]
    MissingComponent(&'static str),

    #[error("repository unavailable at start-up: {0}")]
    Startup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: EngineState,
    pub uptime: Duration,
    pub active_tenants: usize,
    pub bucket_remaining: Vec<(String, f64)>,
    pub last_error_by_component: HashMap<String, String>,
    pub metrics: MetricsSummary,
    pub cache: CacheStats,
}

/// Builder wiring the engine's seams. The repository, counter store, LLM
/// driver, and posting driver are required; everything else has defaults.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    repository: Option<Arc<dyn Repository>>,
    store: Option<Arc<dyn CounterStore>>,
    llm: Option<Arc<dyn LlmDriver>>,
    posting: Option<Arc<dyn PostingDriver>>,
    knowledge: Option<Arc<dyn KnowledgeDriver>>,
    validator: Option<ResponseValidator>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            repository: None,
            store: None,
            llm: None,
            posting: None,
            knowledge: None,
            validator: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn llm_driver(mut self, llm: Arc<dyn LlmDriver>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn posting_driver(mut self, posting: Arc<dyn PostingDriver>) -> Self {
        self.posting = Some(posting);
        self
    }

    pub fn knowledge_driver(mut self, knowledge: Arc<dyn KnowledgeDriver>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let repository = self
            .repository
            .ok_or(EngineError::MissingComponent("repository"))?;
        let store = self
            .store
            .ok_or(EngineError::MissingComponent("counter store"))?;
        let llm = self.llm.ok_or(EngineError::MissingComponent("llm driver"))?;
        let posting = self
            .posting
            .ok_or(EngineError::MissingComponent("posting driver"))?;

        let registry = Arc::new(TenantRegistry::new(clock.clone(), repository.clone()));
        let coordinator = Arc::new(RateLimitCoordinator::new(
            store,
            clock.clone(),
            self.config.limits.clone(),
        ));
        let cache = Arc::new(SemanticCache::new(clock.clone(), self.config.cache.clone()));
        let metrics = Arc::new(EngineMetrics::new());
        let scheduler = Arc::new(Scheduler::new(
            clock.clone(),
            registry.clone(),
            self.config.limits.clone(),
            self.config.reconcile_interval,
        ));

        let mut pipeline = GenerationPipeline::new(PipelineDeps {
            clock: clock.clone(),
            repository,
            registry: registry.clone(),
            coordinator: coordinator.clone(),
            llm,
            posting,
            knowledge: self.knowledge,
            cache: cache.clone(),
            metrics: metrics.clone(),
            config: self.config.clone(),
        });
        if let Some(validator) = self.validator {
            pipeline = pipeline.with_validator(validator);
        }

        Ok(Engine {
            config: self.config,
            clock,
            registry,
            scheduler,
            coordinator,
            cache,
            metrics,
            pipeline: Arc::new(pipeline),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            deferrals: tokio::sync::Mutex::new(JoinSet::new()),
            state: Mutex::new(EngineState::Idle),
            started_mono: Mutex::new(None),
            last_errors: DashMap::new(),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<TenantRegistry>,
    scheduler: Arc<Scheduler>,
    coordinator: Arc<RateLimitCoordinator>,
    cache: Arc<SemanticCache>,
    metrics: Arc<EngineMetrics>,
    pipeline: Arc<GenerationPipeline>,
    /// Drain signal: stop selecting work, let in-flight jobs finish.
    stop: CancellationToken,
    /// Hard cancel, fired when the grace period runs out.
    abort: CancellationToken,
    /// Claim-holder tasks for deferred jobs. Joined during shutdown so no
    /// claim outlives `run`.
    deferrals: tokio::sync::Mutex<JoinSet<()>>,
    state: Mutex<EngineState>,
    started_mono: Mutex<Option<Duration>>,
    last_errors: DashMap<String, String>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Request a graceful shutdown. `run` returns once the drain (and, if
    /// needed, the abort) completes.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn record_error(&self, component: &str, error: impl std::fmt::Display) {
        self.last_errors
            .insert(component.to_string(), error.to_string());
    }

    fn worker_count(&self, active_tenants: usize) -> usize {
        self.config
            .workers
            .unwrap_or_else(|| (2 * active_tenants).clamp(1, 32))
    }

    /// Run until [`shutdown`] is called. Only fatal start-up errors
    /// escape.
    ///
    /// [`shutdown`]: Engine::shutdown
    pub async fn run(self: &Arc<Self>) -> Result<(), EngineError> {
        self.registry
            .load()
            .await
            .map_err(|e| EngineError::Startup(e.to_string()))?;

        let workers = self.worker_count(self.registry.active_count());
        self.metrics.workers_total.set(workers as i64);
        *self.started_mono.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(self.clock.now_mono());
        self.set_state(EngineState::Running);
        info!(
            workers,
            active_tenants = self.registry.active_count(),
            "engine started"
        );

        let (tx, rx) = mpsc::channel::<WorkItem>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let engine = Arc::clone(self);
            let rx = rx.clone();
            pool.spawn(async move { engine.worker_loop(worker_id, rx).await });
        }

        let mut background = JoinSet::new();
        {
            let engine = Arc::clone(self);
            background.spawn(async move { engine.reconciler_loop().await });
        }
        {
            let engine = Arc::clone(self);
            background.spawn(async move { engine.sweeper_loop().await });
        }

        self.scheduler_loop(tx).await;

        // Phase 1: drain. The channel sender is gone, so workers exit once
        // their current job finishes.
        self.set_state(EngineState::Draining);
        info!(grace_secs = self.config.shutdown_grace.as_secs(), "draining workers");
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while pool.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            // Phase 2: abort what is still running.
            warn!("shutdown grace elapsed, aborting in-flight jobs");
            self.abort.cancel();
            pool.shutdown().await;
        }

        self.abort.cancel();
        background.shutdown().await;

        // Deferred-claim holders are aborted and joined here, so every
        // claim is observably released before `run` returns.
        self.deferrals.lock().await.shutdown().await;

        self.registry.flush().await;
        self.set_state(EngineState::Stopped);
        info!("engine stopped");
        Ok(())
    }

    async fn scheduler_loop(&self, tx: mpsc::Sender<WorkItem>) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }

            let idle = (self.metrics.workers_total.get() - self.metrics.workers_busy.get())
                .max(0) as usize;
            let can_dispatch = idle > 0 && self.coordinator.global_llm_available().await;
            if !can_dispatch {
                tokio::select! {
                    _ = tokio::time::sleep(BUSY_TICK) => continue,
                    _ = self.stop.cancelled() => return,
                }
            }

            let plan = self.scheduler.plan(idle);
            let dispatched = !plan.items.is_empty();
            for item in plan.items {
                tokio::select! {
                    result = tx.send(item) => {
                        if result.is_err() {
                            return;
                        }
                    }
                    _ = self.stop.cancelled() => return,
                }
            }

            if !dispatched {
                let sleep_for = plan
                    .next_wakeup
                    .unwrap_or(self.config.reconcile_interval)
                    .max(Duration::from_millis(10));
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = self.stop.cancelled() => return,
                }
            }
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    ) {
        tracing::trace!(worker_id, "worker started");
        loop {
            let item = { rx.lock().await.recv().await };
            let Some(item) = item else {
                return;
            };

            self.metrics.workers_busy.inc();
            let outcome = self.pipeline.run(&item, &self.abort).await;
            self.metrics.workers_busy.dec();

            match outcome {
                JobOutcome::Deferred { retry_after } => {
                    // Park the claim so the scheduler cannot reselect the
                    // tenant before the defer elapses. The holder task is
                    // tracked; shutdown joins it before `run` returns.
                    let abort = self.abort.clone();
                    let mut deferrals = self.deferrals.lock().await;
                    while deferrals.try_join_next().is_some() {}
                    deferrals.spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(retry_after) => {}
                            _ = abort.cancelled() => {}
                        }
                        drop(item);
                    });
                }
                JobOutcome::Failed { post_id, kind } => {
                    self.record_error(
                        "pipeline",
                        format!("job for post {post_id} failed: {kind:?}"),
                    );
                }
                JobOutcome::Published { .. } | JobOutcome::Cancelled => {}
            }
        }
    }

    async fn reconciler_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.abort.cancelled() => return,
            }
            if let Err(e) = self.registry.reconcile().await {
                warn!(error = %e, "registry reconcile failed");
                self.record_error("registry", e);
            }
            self.registry.flush().await;
        }
    }

    async fn sweeper_loop(&self) {
        let period = (self.config.cache.ttl / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.abort.cancelled() => return,
            }
            self.cache.sweep();
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let started = *self.started_mono.lock().unwrap_or_else(|e| e.into_inner());
        let uptime = started
            .map(|s| self.clock.now_mono().saturating_sub(s))
            .unwrap_or(Duration::ZERO);
        let active = self.registry.list_active();
        let bucket_remaining = self.coordinator.remaining_by_key(&active).await;
        HealthSnapshot {
            state: self.state(),
            uptime,
            active_tenants: active.len(),
            bucket_remaining,
            last_error_by_component: self
                .last_errors
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            metrics: self.metrics.summary(),
            cache: self.cache.stats(),
        }
    }
}
