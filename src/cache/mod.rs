//! Semantic prompt cache.
//!
//! Two-level lookup over prior (prompt → completion) pairs: an exact
//! hash-indexed map first, then a cosine-similarity scan over stored
//! embeddings. Exact hits never touch the embedding driver. Eviction is
//! LRU at capacity plus TTL, lazily on access and via a periodic sweep.
//!
//! Locking is single-writer/multi-reader over a std `RwLock`; nothing
//! suspends while a lock is held.

mod flight;

pub use flight::FlightGroup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::config::CacheConfig;

struct Entry {
    embedding: Vec<f32>,
    completion: String,
    created_at: Duration,
    access_seq: u64,
    hits: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    seq: u64,
}

/// Aggregate counters for the metrics surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

/// Embedding-similarity cache with LRU/TTL eviction.
pub struct SemanticCache {
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCache {
    pub fn new(clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            clock,
            config,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                seq: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn expired(&self, entry: &Entry, now: Duration) -> bool {
        now.saturating_sub(entry.created_at) > self.config.ttl
    }

    /// Exact lookup by prompt hash. A hit bumps recency and the hit
    /// counter; an expired entry is dropped and reported as a miss. This
    /// does not count a miss, since the caller falls through to the
    /// semantic level.
    pub fn lookup_exact(&self, hash: &str) -> Option<String> {
        let now = self.clock.now_mono();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let expired = match inner.entries.get(hash) {
            Some(entry) => self.expired(entry, now),
            None => return None,
        };
        if expired {
            inner.entries.remove(hash);
            return None;
        }
        inner.seq += 1;
        let seq = inner.seq;
        let entry = inner.entries.get_mut(hash)?;
        entry.access_seq = seq;
        entry.hits += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.completion.clone())
    }

    /// Nearest-neighbour lookup. Returns the best unexpired entry with
    /// cosine similarity at or above the configured threshold.
    pub fn lookup_similar(&self, embedding: &[f32]) -> Option<String> {
        let now = self.clock.now_mono();
        let best = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner
                .entries
                .iter()
                .filter(|(_, entry)| !self.expired(entry, now))
                .map(|(hash, entry)| (hash.clone(), cosine(embedding, &entry.embedding)))
                .filter(|(_, similarity)| *similarity >= self.config.similarity_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1))
        };

        let (hash, similarity) = best?;
        debug!(similarity, "semantic cache hit");
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        let entry = inner.entries.get_mut(&hash)?;
        entry.access_seq = seq;
        entry.hits += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.completion.clone())
    }

    /// Record a lookup that went all the way to the LLM.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Store a completion under its prompt hash, evicting the least
    /// recently used entries over capacity.
    pub fn insert(&self, hash: impl Into<String>, embedding: Vec<f32>, completion: String) {
        let now = self.clock.now_mono();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        inner.entries.insert(
            hash.into(),
            Entry {
                embedding,
                completion,
                created_at: now,
                access_seq: seq,
                hits: 0,
            },
        );

        while inner.entries.len() > self.config.capacity {
            let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.access_seq)
                .map(|(hash, _)| hash.clone())
            else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_mono();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let before = inner.entries.len();
        let ttl = self.config.ttl;
        inner
            .entries
            .retain(|_, entry| now.saturating_sub(entry.created_at) <= ttl);
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "cache sweep dropped expired entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let size = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            hits,
            misses,
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Cosine similarity of two vectors; 0 for mismatched or zero-norm input.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
