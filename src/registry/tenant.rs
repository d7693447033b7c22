//! Tenant data model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Opaque posting-backend credential bundle.
///
/// Passed by reference into the posting driver and never logged; `Debug`
/// redacts the contents.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials(serde_json::Value);

impl Credentials {
    pub fn new(bundle: serde_json::Value) -> Self {
        Self(bundle)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    /// Raw bundle, for drivers only.
    pub fn expose(&self) -> &serde_json::Value {
        &self.0
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// Per-day activity counters, bucketed by the tenant-local date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounters {
    pub day_key: String,
    pub llm_calls: u64,
    pub posts: u64,
}

impl DailyCounters {
    /// Roll the counters to `day_key`, zeroing them if the day changed.
    /// Calling this twice with the same key is a no-op.
    pub fn roll(&mut self, day_key: &str) {
        if self.day_key != day_key {
            self.day_key = day_key.to_string();
            self.llm_calls = 0;
            self.posts = 0;
        }
    }
}

/// A tenant snapshot as held by the registry.
///
/// The repository owns durable truth; this is the read-optimized in-memory
/// form handed to the scheduler and pipeline.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    pub persona_prompt: String,
    /// Local clock hours (0..=23) during which selection is allowed.
    pub posting_windows: BTreeSet<u8>,
    pub timezone: Tz,
    pub credentials: Credentials,
    /// Reference to a per-tenant knowledge collection, if any.
    pub knowledge_handle: Option<String>,
    pub active: bool,
    /// Wall time of the most recent completed post, `None` if the tenant
    /// never acted. The registry enforces strict per-tenant monotonicity on
    /// writes.
    pub last_acted_at: Option<DateTime<Utc>>,
    pub daily: DailyCounters,
}

impl Tenant {
    /// Build a tenant with the given id and zone; remaining fields take
    /// neutral defaults and are filled in by the caller.
    pub fn new(id: impl Into<String>, timezone: Tz) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            persona_prompt: String::new(),
            posting_windows: BTreeSet::new(),
            timezone,
            credentials: Credentials::empty(),
            knowledge_handle: None,
            active: true,
            last_acted_at: None,
            daily: DailyCounters::default(),
        }
    }

    pub fn with_windows(mut self, hours: impl IntoIterator<Item = u8>) -> Self {
        self.posting_windows = hours.into_iter().collect();
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona_prompt = persona.into();
        self
    }

    pub fn with_knowledge_handle(mut self, handle: impl Into<String>) -> Self {
        self.knowledge_handle = Some(handle.into());
        self
    }
}
