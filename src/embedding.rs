//! Embedding capability and the caching service around it.
//!
//! [`Embedder`] is the injected capability: one attempt, one batch, no retry.
//! [`HttpEmbedder`] implements it against an OpenAI-compatible
//! `POST /v1/embeddings` endpoint. [`EmbeddingService`] wraps any `Embedder`
//! with the policy layer:
//!
//! - a content-hash cache (SHA-256 of the exact text) guaranteeing at most
//!   one provider call per distinct text,
//! - single-flight coordination: concurrent requests for the same hash await
//!   the in-flight call instead of duplicating it; if the owner fails, the
//!   slot is released so a waiter can retry,
//! - bounded retry with exponential backoff around every provider call,
//!   failing fast on rejections a retry cannot fix (4xx other than 429),
//! - batching of chunk embeddings into grouped calls.
//!
//! Identical input text yields the identical cached vector. Across cache
//! evictions (process restarts) the provider itself may be nondeterministic;
//! that is a provider property, not hidden here.
//!
//! Also home to the vector byte codec shared with the SQLite index:
//! [`vec_to_blob`] / [`blob_to_vec`] (little-endian f32), and
//! [`cosine_similarity`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::chunk::{content_hash, Chunk};
use crate::error::{RagError, Result};

/// The `[embedding]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub model: String,
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: "text-embedding-3-small".to_string(),
            dims: 1536,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dims == 0 {
            return Err(RagError::InvalidConfig(
                "embedding.dims must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(RagError::InvalidConfig(
                "embedding.batch_size must be >= 1".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(RagError::InvalidConfig(
                "embedding.model must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Text-embedding capability. One call, one batch, no retry — the
/// [`EmbeddingService`] owns the retry policy.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

/// OpenAI-compatible HTTP embedding provider.
///
/// Reads the API key from `OPENAI_API_KEY`. Performs exactly one request per
/// [`Embedder::embed`] call; transient/permanent classification and retry
/// live in [`EmbeddingService`].
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            RagError::InvalidConfig("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::EmbeddingProvider {
                attempts: 1,
                retryable: true,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            // Rate limits and server errors are worth retrying; any other
            // client error will fail the same way on every attempt.
            return Err(RagError::EmbeddingProvider {
                attempts: 1,
                retryable: status.as_u16() == 429 || status.is_server_error(),
                reason: format!("HTTP {}: {}", status, body_text),
            });
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| RagError::EmbeddingProvider {
                    attempts: 1,
                    retryable: false,
                    reason: e.to_string(),
                })?;
        parse_embeddings_response(&json, texts.len())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Extract `data[].embedding` arrays from an embeddings API response.
fn parse_embeddings_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::EmbeddingProvider {
            attempts: 1,
            retryable: false,
            reason: "response missing data array".to_string(),
        })?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| RagError::EmbeddingProvider {
                attempts: 1,
                retryable: false,
                reason: "response item missing embedding".to_string(),
            })?;
        vectors.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }

    if vectors.len() != expected {
        return Err(RagError::EmbeddingProvider {
            attempts: 1,
            retryable: false,
            reason: format!("expected {} vectors, got {}", expected, vectors.len()),
        });
    }
    Ok(vectors)
}

struct CacheInner {
    ready: HashMap<String, Arc<Vec<f32>>>,
    in_flight: HashSet<String>,
}

/// Caching, deduplicating, retrying front for an [`Embedder`].
pub struct EmbeddingService {
    provider: Arc<dyn Embedder>,
    batch_size: usize,
    max_retries: u32,
    backoff_ms: u64,
    cache: Mutex<CacheInner>,
    /// Woken whenever an in-flight slot resolves (success or failure).
    completed: Notify,
}

enum Slot {
    Hit(Arc<Vec<f32>>),
    Owned,
    Wait,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            cache: Mutex::new(CacheInner {
                ready: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            completed: Notify::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed one text (typically a query), going through cache and
    /// single-flight coordination.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let hash = content_hash(text);
        loop {
            let notified = self.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let slot = self.claim(&hash);
            match slot {
                Slot::Hit(v) => return Ok((*v).clone()),
                Slot::Owned => {
                    let result = self.call_with_retry(&[text.to_string()]).await;
                    return self.resolve_single(&hash, result);
                }
                Slot::Wait => notified.await,
            }
        }
    }

    /// Embed a batch of chunks, amortizing provider calls.
    ///
    /// Distinct uncached texts are grouped into provider batches; texts whose
    /// embedding is already in flight elsewhere are awaited, not re-fetched.
    /// Returns one vector per input chunk, in order.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        // Claim ownership of every distinct uncached hash in one pass.
        let mut owned: Vec<(String, String)> = Vec::new(); // (hash, text)
        {
            let mut inner = self.cache.lock().unwrap();
            let mut seen = HashSet::new();
            for chunk in chunks {
                if !seen.insert(chunk.hash.clone()) {
                    continue;
                }
                if inner.ready.contains_key(&chunk.hash)
                    || inner.in_flight.contains(&chunk.hash)
                {
                    continue;
                }
                inner.in_flight.insert(chunk.hash.clone());
                owned.push((chunk.hash.clone(), chunk.text.clone()));
            }
        }

        let cached = chunks.len() - owned.len();
        if cached > 0 {
            tracing::debug!(total = chunks.len(), cached, "embedding cache hits");
        }

        // Grouped provider calls for everything we own.
        for group in owned.chunks(self.batch_size) {
            let texts: Vec<String> = group.iter().map(|(_, t)| t.clone()).collect();
            match self.call_with_retry(&texts).await {
                Ok(vectors) => {
                    let mut inner = self.cache.lock().unwrap();
                    for ((hash, _), vector) in group.iter().zip(vectors) {
                        inner.in_flight.remove(hash);
                        inner.ready.insert(hash.clone(), Arc::new(vector));
                    }
                    drop(inner);
                    self.completed.notify_waiters();
                }
                Err(e) => {
                    // Release every slot we still hold so waiters can retry.
                    let mut inner = self.cache.lock().unwrap();
                    for (hash, _) in &owned {
                        inner.in_flight.remove(hash);
                    }
                    drop(inner);
                    self.completed.notify_waiters();
                    return Err(e);
                }
            }
        }

        // Collect results; anything still unresolved is owned by a
        // concurrent caller, so go through the single-text path to await it.
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let hit = {
                let inner = self.cache.lock().unwrap();
                inner.ready.get(&chunk.hash).cloned()
            };
            match hit {
                Some(v) => out.push((*v).clone()),
                None => out.push(self.embed_text(&chunk.text).await?),
            }
        }
        Ok(out)
    }

    fn claim(&self, hash: &str) -> Slot {
        let mut inner = self.cache.lock().unwrap();
        if let Some(v) = inner.ready.get(hash) {
            return Slot::Hit(v.clone());
        }
        if inner.in_flight.contains(hash) {
            return Slot::Wait;
        }
        inner.in_flight.insert(hash.to_string());
        Slot::Owned
    }

    fn resolve_single(&self, hash: &str, result: Result<Vec<Vec<f32>>>) -> Result<Vec<f32>> {
        let mut inner = self.cache.lock().unwrap();
        inner.in_flight.remove(hash);
        let out = match result {
            Ok(mut vectors) if !vectors.is_empty() => {
                let v = Arc::new(vectors.swap_remove(0));
                inner.ready.insert(hash.to_string(), v.clone());
                Ok((*v).clone())
            }
            Ok(_) => Err(RagError::EmbeddingProvider {
                attempts: 1,
                retryable: false,
                reason: "provider returned no vectors".to_string(),
            }),
            Err(e) => Err(e),
        };
        drop(inner);
        self.completed.notify_waiters();
        out
    }

    /// Bounded retry with exponential backoff around one provider call.
    /// Non-retryable rejections stop the loop on the spot.
    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_reason = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(self.backoff_ms << (attempt - 1).min(5));
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "embedding retry");
                tokio::time::sleep(delay).await;
            }
            match self.provider.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(RagError::EmbeddingProvider {
                    retryable: false,
                    reason,
                    ..
                }) => {
                    return Err(RagError::EmbeddingProvider {
                        attempts: attempt + 1,
                        retryable: false,
                        reason,
                    });
                }
                Err(e) => last_reason = e.to_string(),
            }
        }
        Err(RagError::EmbeddingProvider {
            attempts: self.max_retries + 1,
            retryable: true,
            reason: last_reason,
        })
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_document, ChunkConfig};
    use crate::loader::LoadedDocument;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Deterministic embedder: vector derived from the text bytes. Counts
    /// calls and can be scripted to fail the first N attempts.
    struct StubEmbedder {
        calls: AtomicU32,
        fail_first: u32,
        fail_retryable: bool,
    }

    impl StubEmbedder {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                fail_retryable: true,
            }
        }

        /// Scripted failures look like a hard client rejection (e.g. 401).
        fn rejecting(fail_first: u32) -> Self {
            Self {
                fail_retryable: false,
                ..Self::new(fail_first)
            }
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(RagError::EmbeddingProvider {
                    attempts: 1,
                    retryable: self.fail_retryable,
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(texts.iter().map(|t| stub_vector(t)).collect())
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        fn dims(&self) -> usize {
            4
        }
    }

    fn stub_vector(text: &str) -> Vec<f32> {
        let mut v = [0.1f32; 4];
        for (i, b) in text.bytes().enumerate() {
            v[i % 4] += b as f32 / 255.0;
        }
        v.to_vec()
    }

    fn fast_config() -> EmbeddingConfig {
        EmbeddingConfig {
            max_retries: 3,
            backoff_ms: 1,
            batch_size: 8,
            ..EmbeddingConfig::default()
        }
    }

    fn chunks_for(text: &str) -> Vec<Chunk> {
        let doc = LoadedDocument {
            source_path: "t.txt".to_string(),
            title: "t".to_string(),
            pages: vec![text.to_string()],
        };
        chunk_document(
            "d1",
            &doc,
            &ChunkConfig {
                max_tokens: 8,
                overlap_tokens: 2,
            },
        )
        .unwrap()
        .collect()
    }

    #[tokio::test]
    async fn identical_text_embeds_once() {
        let provider = Arc::new(StubEmbedder::new(0));
        let service = EmbeddingService::new(provider.clone(), &fast_config());

        let a = service.embed_text("right of way").await.unwrap();
        let b = service.embed_text("right of way").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_bound() {
        // Fails twice, succeeds on the third attempt (scenario: transient
        // provider outage).
        let provider = Arc::new(StubEmbedder::new(2));
        let service = EmbeddingService::new(provider.clone(), &fast_config());

        let v = service.embed_text("parking rules").await.unwrap();
        assert_eq!(v, stub_vector("parking rules"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_attempt_count() {
        let provider = Arc::new(StubEmbedder::new(100));
        let service = EmbeddingService::new(provider.clone(), &fast_config());

        let err = service.embed_text("anything").await.unwrap_err();
        match err {
            RagError::EmbeddingProvider { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn hard_rejection_is_not_retried() {
        let provider = Arc::new(StubEmbedder::rejecting(100));
        let service = EmbeddingService::new(provider.clone(), &fast_config());

        let err = service.embed_text("anything").await.unwrap_err();
        match err {
            RagError::EmbeddingProvider {
                attempts,
                retryable,
                ..
            } => {
                assert_eq!(attempts, 1);
                assert!(!retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
        // A rejection that retrying cannot fix stops after the first call.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chunk_batches_deduplicate_by_hash() {
        let provider = Arc::new(StubEmbedder::new(0));
        let service = EmbeddingService::new(provider.clone(), &fast_config());

        let mut chunks = chunks_for("alpha bravo charlie delta echo foxtrot golf hotel india");
        // Duplicate chunk text under a different id: must share the vector.
        let mut dup = chunks[0].clone();
        dup.id = "d2#0".to_string();
        dup.document_id = "d2".to_string();
        chunks.push(dup);

        let vectors = service.embed_chunks(&chunks).await.unwrap();
        assert_eq!(vectors.len(), chunks.len());
        assert_eq!(vectors[0], vectors[chunks.len() - 1]);
        // One grouped call covered all distinct texts.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_same_hash_single_flight() {
        let provider = Arc::new(StubEmbedder::new(0));
        let service = Arc::new(EmbeddingService::new(provider.clone(), &fast_config()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = service.clone();
            handles.push(tokio::spawn(
                async move { s.embed_text("same text").await },
            ));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
