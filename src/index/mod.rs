//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines the storage operations the retrieval
//! pipeline needs, enabling pluggable backends: [`SqliteIndex`] for
//! persistence, [`MemoryIndex`] for tests.
//!
//! Contract highlights (shared by all backends):
//!
//! - `upsert` is idempotent by chunk id — re-upserting replaces the prior
//!   vector and chunk record.
//! - `search` ranks by cosine similarity, ties broken by chunk id ascending,
//!   so identical state and query always return the identical order.
//! - `delete_document` is synchronous: a search issued after it returns never
//!   sees the deleted entries.
//! - A stored vector without a backing chunk is [`RagError::IndexCorruption`]
//!   — surfaced, never silently repaired.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::error::Result;

/// A chunk plus its embedding vector, as persisted by the index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Per-document metadata recorded at ingest time.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub source_path: String,
    pub title: String,
    pub page_count: usize,
    pub chunk_count: usize,
    pub ingested_at: chrono::DateTime<chrono::Utc>,
}

/// One ranked hit from [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Raw cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Abstract vector store for chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the entry for `entry.chunk.id`.
    async fn upsert(&self, entry: &IndexEntry) -> Result<()>;

    /// Record (or replace) a document's ingest metadata.
    async fn record_document(&self, record: &DocumentRecord) -> Result<()>;

    /// Fetch a document's ingest metadata.
    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    /// Remove every entry and the metadata belonging to `document_id`
    /// (used on re-ingestion).
    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Nearest-neighbor search: at most `k` hits ranked by cosine similarity
    /// descending, ties by chunk id ascending. `document_filter` restricts
    /// hits to one document.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>>;

    /// Fetch the stored chunk behind a hit, if present.
    async fn chunk(&self, chunk_id: &str) -> Result<Option<Chunk>>;

    /// Number of stored entries (diagnostics / tests).
    async fn entry_count(&self) -> Result<usize>;
}

/// Shared ranking: sort by score descending, chunk id ascending, cut to `k`.
pub(crate) fn rank_hits(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}
