//! The embedding capability (§6) and the query-embedding cache in front of
//! it.
//!
//! Like [`crate::blob::BlobStore`], this is a capability the core consumes
//! through a trait -- concrete providers (Vercel AI SDK, Cloudflare
//! Workers AI, ...) are out of scope (§1) and live in adapters above this
//! crate. [`HnswIndex`] and [`hybrid_search`] only ever see raw `Vec<f32>`
//! vectors; turning text into vectors is entirely this module's job.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant as StdInstant};

/// One text-to-vector provider (§6).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str, is_query: bool) -> crate::error::DbResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String], is_query: bool) -> crate::error::DbResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, is_query).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;

    fn model(&self) -> &str;
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    text: String,
    model: String,
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: StdInstant,
}

/// LRU cache for *query* embeddings, keyed by `(text, model)` (§6: "caches
/// query embeddings in an LRU with TTL"). Document embeddings are not
/// cached -- each is written once and never re-embedded.
///
/// Kept as a small hand-rolled structure (a map plus an insertion-order
/// list) rather than pulling in a dedicated LRU crate, matching the
/// dependency-light style of [`crate::cancel::CancellationToken`].
pub struct EmbeddingCache {
    capacity: usize,
    ttl: Duration,
    entries: parking_lot::Mutex<HashMap<CacheKey, CacheEntry>>,
    order: parking_lot::Mutex<Vec<CacheKey>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        EmbeddingCache {
            capacity,
            ttl,
            entries: parking_lot::Mutex::new(HashMap::new()),
            order: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, text: &str, model: &str) -> Option<Vec<f32>> {
        let key = CacheKey { text: text.to_string(), model: model.to_string() };
        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            entries.remove(&key);
            self.order.lock().retain(|k| k != &key);
            return None;
        }
        let vector = entry.vector.clone();
        drop(entries);
        let mut order = self.order.lock();
        order.retain(|k| k != &key);
        order.push(key);
        Some(vector)
    }

    pub fn put(&self, text: &str, model: &str, vector: Vec<f32>) {
        let key = CacheKey { text: text.to_string(), model: model.to_string() };
        let mut entries = self.entries.lock();
        let mut order = self.order.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            if let Some(evicted) = (!order.is_empty()).then(|| order.remove(0)) {
                entries.remove(&evicted);
            }
        }
        order.retain(|k| k != &key);
        order.push(key.clone());
        entries.insert(key, CacheEntry { vector, inserted_at: StdInstant::now() });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Embeds a query string, consulting `cache` first (§6). Document
/// embedding (`is_query: false`) always bypasses the cache -- it's a
/// write-side, one-shot operation.
pub async fn embed_query(
    embedder: &dyn Embedder,
    cache: &EmbeddingCache,
    text: &str,
) -> crate::error::DbResult<Vec<f32>> {
    let model = embedder.model();
    if let Some(cached) = cache.get(text, model) {
        return Ok(cached);
    }
    let vector = embedder.embed(text, true).await?;
    cache.put(text, model, vector.clone());
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEmbedder {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str, _is_query: bool) -> crate::error::DbResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32])
        }

        fn dimensions(&self) -> usize {
            1
        }

        fn model(&self) -> &str {
            "counting-embedder"
        }
    }

    #[tokio::test]
    async fn repeated_query_text_hits_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = CountingEmbedder { calls: calls.clone() };
        let cache = EmbeddingCache::new(8, Duration::from_secs(60));
        embed_query(&embedder, &cache, "hello").await.unwrap();
        embed_query(&embedder, &cache, "hello").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recomputed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = CountingEmbedder { calls: calls.clone() };
        let cache = EmbeddingCache::new(8, Duration::from_millis(1));
        embed_query(&embedder, &cache, "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        embed_query(&embedder, &cache, "hello").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = EmbeddingCache::new(2, Duration::from_secs(60));
        cache.put("a", "m", vec![1.0]);
        cache.put("b", "m", vec![2.0]);
        cache.put("c", "m", vec![3.0]); // evicts "a"
        assert!(cache.get("a", "m").is_none());
        assert!(cache.get("b", "m").is_some());
        assert!(cache.get("c", "m").is_some());
    }
}
