//! Engine configuration.
//!
//! Typed configuration records for every tunable the engine exposes, with
//! defaults matching a small production deployment. `from_env` reads
//! `CHORUS_*` overrides; `validate` rejects values the engine cannot run
//! with before any component is constructed.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors. Treated as fatal at engine start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("failed to parse {key}: {message}")]
    Parse { key: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size. `None` selects `min(32, 2 × active tenants)` at
    /// start.
    pub workers: Option<usize>,
    /// Per-attempt timeout for LLM completion calls. Embedding calls run
    /// under the same bound.
    pub llm_timeout: Duration,
    /// Per-attempt timeout for posting-backend calls.
    pub post_timeout: Duration,
    /// Per-call timeout for repository operations.
    pub repo_timeout: Duration,
    /// How long a validated post may wait for the posting quota before the
    /// job fails with `quota_exceeded`.
    pub post_park_max: Duration,
    /// Grace period for in-flight jobs during shutdown.
    pub shutdown_grace: Duration,
    /// Registry reconciliation interval.
    pub reconcile_interval: Duration,
    /// Maximum length of a published post, after whitespace normalization.
    pub post_max_len: usize,
    /// How many recent published posts the duplication check compares
    /// against.
    pub dup_window: usize,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub knowledge: KnowledgeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            llm_timeout: Duration::from_secs(30),
            post_timeout: Duration::from_secs(30),
            repo_timeout: Duration::from_secs(10),
            post_park_max: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(30),
            post_max_len: 280,
            dup_window: 10,
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
            knowledge: KnowledgeConfig::default(),
        }
    }
}

/// Semantic cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    pub similarity_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
            similarity_threshold: 0.95,
        }
    }
}

/// Quota limits enforced through the counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-tenant LLM calls per day.
    pub client_daily_llm: u64,
    /// Per-tenant published posts per day.
    pub client_daily_posts: u64,
    /// Per-tenant LLM pacing, requests per second. Bucket capacity is 1, so
    /// this is a hard inter-request gap, not a burstable average.
    pub client_llm_per_sec: f64,
    /// Deployment-wide LLM calls per day.
    pub global_daily_llm: u64,
    /// Defer applied when the counter store is unreachable or times out.
    pub default_backoff: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            client_daily_llm: 50,
            client_daily_posts: 10,
            client_llm_per_sec: 1.0,
            global_daily_llm: 1000,
            default_backoff: Duration::from_secs(5),
        }
    }
}

/// Knowledge-context retrieval bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Maximum context snippets injected into a render.
    pub max_entries: usize,
    /// Minimum similarity for a snippet to be considered relevant.
    pub similarity_threshold: f32,
    /// Per-call timeout for knowledge searches.
    pub timeout: Duration,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            max_entries: 3,
            similarity_threshold: 0.7,
            timeout: Duration::from_secs(10),
        }
    }
}

const ENV_PREFIX: &str = "CHORUS_";

fn env_parse<T: FromStr>(key: &str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let full = format!("{ENV_PREFIX}{key}");
    match std::env::var(&full) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                key: full,
                message: e.to_string(),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::Parse {
            key: full,
            message: e.to_string(),
        }),
    }
}

fn env_secs(key: &str, into: &mut Duration) -> ConfigResult<()> {
    if let Some(secs) = env_parse::<u64>(key)? {
        *into = Duration::from_secs(secs);
    }
    Ok(())
}

impl EngineConfig {
    /// Build a configuration from defaults plus `CHORUS_*` environment
    /// overrides. Durations are given in whole seconds.
    pub fn from_env() -> ConfigResult<Self> {
        let mut cfg = Self::default();

        if let Some(workers) = env_parse::<usize>("WORKERS")? {
            cfg.workers = Some(workers);
        }
        env_secs("LLM_TIMEOUT_SECS", &mut cfg.llm_timeout)?;
        env_secs("POST_TIMEOUT_SECS", &mut cfg.post_timeout)?;
        env_secs("REPO_TIMEOUT_SECS", &mut cfg.repo_timeout)?;
        env_secs("KNOWLEDGE_TIMEOUT_SECS", &mut cfg.knowledge.timeout)?;
        env_secs("POST_PARK_MAX_SECS", &mut cfg.post_park_max)?;
        env_secs("SHUTDOWN_GRACE_SECS", &mut cfg.shutdown_grace)?;
        env_secs("RECONCILE_INTERVAL_SECS", &mut cfg.reconcile_interval)?;
        if let Some(len) = env_parse::<usize>("POST_MAX_LEN")? {
            cfg.post_max_len = len;
        }
        if let Some(n) = env_parse::<usize>("DUP_WINDOW")? {
            cfg.dup_window = n;
        }

        if let Some(cap) = env_parse::<usize>("CACHE_CAP")? {
            cfg.cache.capacity = cap;
        }
        env_secs("CACHE_TTL_SECS", &mut cfg.cache.ttl)?;
        if let Some(sim) = env_parse::<f32>("CACHE_SIM_THRESHOLD")? {
            cfg.cache.similarity_threshold = sim;
        }

        if let Some(n) = env_parse::<u64>("CLIENT_DAILY_LLM")? {
            cfg.limits.client_daily_llm = n;
        }
        if let Some(n) = env_parse::<u64>("CLIENT_DAILY_POSTS")? {
            cfg.limits.client_daily_posts = n;
        }
        if let Some(rate) = env_parse::<f64>("CLIENT_LLM_PER_SEC")? {
            cfg.limits.client_llm_per_sec = rate;
        }
        if let Some(n) = env_parse::<u64>("GLOBAL_DAILY_LLM")? {
            cfg.limits.global_daily_llm = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field: field.to_string(),
                message: message.into(),
            }
        }

        if self.workers == Some(0) {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.post_max_len == 0 {
            return Err(invalid("post_max_len", "must be positive"));
        }
        if self.llm_timeout.is_zero()
            || self.post_timeout.is_zero()
            || self.repo_timeout.is_zero()
            || self.knowledge.timeout.is_zero()
        {
            return Err(invalid("timeouts", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(invalid(
                "cache.similarity_threshold",
                "must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.knowledge.similarity_threshold) {
            return Err(invalid(
                "knowledge.similarity_threshold",
                "must be within 0.0..=1.0",
            ));
        }
        if self.limits.client_llm_per_sec <= 0.0 {
            return Err(invalid("limits.client_llm_per_sec", "must be positive"));
        }
        if self.limits.client_daily_llm == 0
            || self.limits.client_daily_posts == 0
            || self.limits.global_daily_llm == 0
        {
            return Err(invalid("limits", "daily limits must be positive"));
        }
        Ok(())
    }
}
