//! Deterministic in-process drivers.
//!
//! These back the test suite and local runs: a scripted LLM, a posting
//! backend with an adjustable rate-limit budget, and a word-overlap
//! knowledge store. All are safe to share across tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::{
    Completion, CompletionParams, DriverError, DriverResult, KnowledgeDriver, KnowledgeSnippet,
    LlmDriver, PostingDriver, PublishReceipt, TokenUsage,
};
use crate::registry::Credentials;

/// LLM driver that replays scripted responses.
///
/// Responses are consumed in order; once the script is empty the default
/// response is returned. Errors can be queued ahead of responses to
/// exercise retry paths. Embeddings are looked up from registered vectors,
/// falling back to a stable pseudo-embedding derived from the text.
pub struct StaticLlm {
    responses: Mutex<VecDeque<String>>,
    failures: Mutex<VecDeque<DriverError>>,
    default_response: String,
    embeddings: DashMap<String, Vec<f32>>,
    latency: Option<Duration>,
    completion_calls: AtomicU64,
    embed_calls: AtomicU64,
}

impl Default for StaticLlm {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            default_response: "Shipping small improvements every day.".to_string(),
            embeddings: DashMap::new(),
            latency: None,
            completion_calls: AtomicU64::new(0),
            embed_calls: AtomicU64::new(0),
        }
    }
}

impl StaticLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = text.into();
        self
    }

    /// Add artificial latency to completion calls, to create overlap in
    /// concurrency tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(text.into());
    }

    /// Queue an error; it is returned before any scripted response.
    pub fn push_failure(&self, error: DriverError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Pin the embedding returned for `text`.
    pub fn register_embedding(&self, text: impl Into<String>, embedding: Vec<f32>) {
        self.embeddings.insert(text.into(), embedding);
    }

    pub fn completion_calls(&self) -> u64 {
        self.completion_calls.load(Ordering::Relaxed)
    }

    pub fn embed_calls(&self) -> u64 {
        self.embed_calls.load(Ordering::Relaxed)
    }

    fn pseudo_embedding(text: &str) -> Vec<f32> {
        // Stable unit vector from the text digest. Identical texts map to
        // identical vectors; unrelated texts land far apart.
        let digest = Sha256::digest(text.as_bytes());
        let mut v: Vec<f32> = digest
            .chunks(4)
            .take(8)
            .map(|chunk| {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(chunk);
                (u32::from_be_bytes(bytes) as f32 / u32::MAX as f32) - 0.5
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl LlmDriver for StaticLlm {
    async fn complete(&self, prompt: &str, _params: &CompletionParams) -> DriverResult<Completion> {
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.completion_calls.fetch_add(1, Ordering::Relaxed);
        let text = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone());
        Ok(Completion {
            usage: TokenUsage {
                input_tokens: (prompt.len() / 4) as u32,
                output_tokens: (text.len() / 4) as u32,
            },
            text,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn embed(&self, text: &str) -> DriverResult<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(pinned) = self.embeddings.get(text) {
            return Ok(pinned.clone());
        }
        Ok(Self::pseudo_embedding(text))
    }
}

/// Posting backend over process memory, with an adjustable rate-limit
/// budget for quota tests.
pub struct MemoryPosting {
    published: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<DriverError>>,
    budget: AtomicI64,
    sequence: AtomicU64,
    publish_calls: AtomicU64,
    reject_duplicates: bool,
}

impl Default for MemoryPosting {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            budget: AtomicI64::new(i64::MAX),
            sequence: AtomicU64::new(0),
            publish_calls: AtomicU64::new(0),
            reject_duplicates: false,
        }
    }
}

impl MemoryPosting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a publish whose text was already published.
    pub fn with_duplicate_rejection(mut self) -> Self {
        self.reject_duplicates = true;
        self
    }

    /// Allow only `budget` more publishes before returning rate limits.
    pub fn set_budget(&self, budget: i64) {
        self.budget.store(budget, Ordering::Relaxed);
    }

    pub fn push_failure(&self, error: DriverError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// `(external_id, text)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn publish_calls(&self) -> u64 {
        self.publish_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PostingDriver for MemoryPosting {
    async fn publish(
        &self,
        _credentials: &Credentials,
        text: &str,
    ) -> DriverResult<PublishReceipt> {
        self.publish_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }
        if self.budget.fetch_sub(1, Ordering::Relaxed) <= 0 {
            return Err(DriverError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            });
        }
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        if self.reject_duplicates && published.iter().any(|(_, t)| t == text) {
            return Err(DriverError::DuplicateContent);
        }
        let external_id = format!("post-{}", self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        published.push((external_id.clone(), text.to_string()));
        Ok(PublishReceipt { external_id })
    }

    async fn delete(&self, _credentials: &Credentials, external_id: &str) -> DriverResult<()> {
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        let before = published.len();
        published.retain(|(id, _)| id != external_id);
        if published.len() == before {
            return Err(DriverError::NonRetryable(format!(
                "unknown external id {external_id}"
            )));
        }
        Ok(())
    }
}

/// Knowledge store scored by word overlap.
///
/// Good enough to exercise context plumbing deterministically without an
/// embedding model.
#[derive(Default)]
pub struct MemoryKnowledge {
    collections: DashMap<String, Vec<(String, HashMap<String, String>)>>,
    failures: Mutex<VecDeque<DriverError>>,
}

impl MemoryKnowledge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(
        &self,
        handle: impl Into<String>,
        content: impl Into<String>,
        metadata: HashMap<String, String>,
    ) {
        self.collections
            .entry(handle.into())
            .or_default()
            .push((content.into(), metadata));
    }

    pub fn push_failure(&self, error: DriverError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    fn word_overlap(a: &str, b: &str) -> f32 {
        let set_a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
        let set_b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
        if set_a.is_empty() || set_b.is_empty() {
            return 0.0;
        }
        let intersection = set_a.intersection(&set_b).count() as f32;
        let union = set_a.union(&set_b).count() as f32;
        intersection / union
    }
}

#[async_trait]
impl KnowledgeDriver for MemoryKnowledge {
    async fn search(
        &self,
        handle: &str,
        query: &str,
        max_results: usize,
        min_similarity: f32,
    ) -> DriverResult<Vec<KnowledgeSnippet>> {
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }
        let Some(entries) = self.collections.get(handle) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<KnowledgeSnippet> = entries
            .iter()
            .enumerate()
            .map(|(i, (content, metadata))| KnowledgeSnippet {
                id: format!("{handle}-{i}"),
                content: content.clone(),
                similarity: Self::word_overlap(query, content),
                metadata: metadata.clone(),
            })
            .filter(|snippet| snippet.similarity >= min_similarity)
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(max_results);
        Ok(scored)
    }
}
