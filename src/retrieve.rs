//! Retrieval and re-ranking.
//!
//! The [`Retriever`] embeds the query, over-fetches candidates from the
//! vector index, then re-ranks with a blend of normalized cosine similarity
//! and lexical word overlap before selecting the top chunks that fit the
//! context token budget.
//!
//! Score blend: `(1 - w) * cosine_norm + w * jaccard`, where `cosine_norm`
//! is min-max normalized over the candidate set and `w` is
//! `retrieval.lexical_weight`. Ordering is deterministic: score descending,
//! chunk id ascending on ties.

use std::collections::HashSet;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::index::VectorIndex;

/// A retrieved chunk with its blended relevance score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            config,
        }
    }

    /// Retrieve up to `retrieval.k` chunks for `query` whose token counts fit
    /// `budget_tokens`. A blank query or an empty index yields an empty
    /// result, never an error.
    pub async fn retrieve(&self, query: &str, budget_tokens: usize) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embeddings.embed_text(query).await?;
        let overfetch = self.config.k * self.config.overfetch_factor;
        let hits = self.index.search(&query_vec, overfetch, None).await?;
        if hits.is_empty() {
            tracing::debug!(query, "no candidates in index");
            return Ok(Vec::new());
        }

        // Min-max normalize cosine scores over the candidate set.
        let min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
        let max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;

        let query_words = word_set(query);
        let w = self.config.lexical_weight;

        let mut scored = Vec::with_capacity(hits.len());
        for hit in &hits {
            // A hit whose chunk vanished lost a race with a concurrent
            // delete or re-ingest. Skip it; the remaining candidates still
            // answer the query.
            let Some(chunk) = self.index.chunk(&hit.chunk_id).await? else {
                tracing::debug!(chunk_id = %hit.chunk_id, "candidate deleted mid-retrieval, skipped");
                continue;
            };

            let cosine_norm = if range > f32::EPSILON {
                (hit.score - min) / range
            } else {
                1.0
            };
            let lexical = if w > 0.0 {
                jaccard(&query_words, &word_set(&chunk.text))
            } else {
                0.0
            };
            scored.push(ScoredChunk {
                score: (1.0 - w) * cosine_norm + w * lexical,
                chunk,
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });

        // Greedy budget selection in rank order. Oversize chunks are skipped,
        // not truncated, so a later smaller chunk can still use the room.
        let mut selected = Vec::new();
        let mut used = 0usize;
        for sc in scored {
            if selected.len() == self.config.k {
                break;
            }
            if used + sc.chunk.token_count > budget_tokens {
                continue;
            }
            used += sc.chunk.token_count;
            selected.push(sc);
        }

        tracing::debug!(
            candidates = hits.len(),
            selected = selected.len(),
            used_tokens = used,
            "retrieval complete"
        );
        Ok(selected)
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}
