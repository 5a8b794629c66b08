//! In-memory vector index.
//!
//! Backs tests and short-lived sessions where persistence is not wanted.
//! Brute-force cosine scan over a `HashMap`, which is exact and plenty fast
//! at corpus sizes in the tens of thousands of chunks.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::embedding::cosine_similarity;
use crate::error::Result;

use super::{rank_hits, DocumentRecord, IndexEntry, SearchHit, VectorIndex};

#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
    documents: RwLock<HashMap<String, DocumentRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.chunk.id.clone(), entry.clone());
        Ok(())
    }

    async fn record_document(&self, record: &DocumentRecord) -> Result<()> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(document_id).cloned())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| e.chunk.document_id != document_id);
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.remove(document_id);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let hits = entries
            .values()
            .filter(|e| document_filter.is_none_or(|d| e.chunk.document_id == d))
            .map(|e| SearchHit {
                chunk_id: e.chunk.id.clone(),
                score: cosine_similarity(query, &e.vector),
            })
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(chunk_id).map(|e| e.chunk.clone()))
    }

    async fn entry_count(&self) -> Result<usize> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.len())
    }
}
