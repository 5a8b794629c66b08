//! Token-bounded, overlapping text chunker.
//!
//! Splits a [`LoadedDocument`] into [`Chunk`]s of at most `max_tokens`
//! tokens, with exactly `overlap_tokens` tokens shared between consecutive
//! chunks (except at page start/end). Chunk boundaries snap to sentence ends
//! when one falls inside the window, falling back to a hard token cut.
//!
//! Chunking is lazy and restartable: [`chunk_document`] returns an iterator
//! that tokenizes one page at a time; calling it again replays the identical
//! sequence. Each chunk carries full provenance — document id, 1-based page,
//! byte offsets into the page, token count, and a SHA-256 content hash.
//!
//! Chunk ids are deterministic (`"{document_id}#{index}"`) so re-ingesting a
//! document upserts the same ids instead of accumulating duplicates.
//!
//! Overlap does not cross page boundaries: each page starts a fresh chunk,
//! which keeps every chunk attributable to a single page for citations.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};
use crate::loader::LoadedDocument;
use crate::token;

/// Chunking parameters, loaded from the `[chunking]` config section.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkConfig {
    /// Maximum tokens per chunk.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Tokens shared between consecutive chunks. Must be < `max_tokens`.
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

fn default_max_tokens() -> usize {
    200
}
fn default_overlap_tokens() -> usize {
    20
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(RagError::InvalidConfig(
                "chunking.max_tokens must be > 0".to_string(),
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(RagError::InvalidConfig(format!(
                "chunking.overlap_tokens ({}) must be < max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// A bounded, overlapping segment of one document page — the unit of
/// retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Deterministic id: `"{document_id}#{index}"`.
    pub id: String,
    pub document_id: String,
    /// Position in the document's chunk sequence, contiguous from 0.
    pub index: usize,
    /// 1-based page this chunk was cut from.
    pub page: usize,
    /// Exact slice of the page text (never trimmed or truncated).
    pub text: String,
    pub token_count: usize,
    /// Byte offset of the chunk's first token within its page.
    pub start_offset: usize,
    /// Byte offset one past the chunk's last token within its page.
    pub end_offset: usize,
    /// SHA-256 of `text`, the embedding cache key.
    pub hash: String,
}

/// SHA-256 hex digest of a text, used as the embedding dedup key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lazily chunk `doc`, yielding chunks in document order.
///
/// Fails fast with [`RagError::InvalidConfig`] before producing anything.
pub fn chunk_document<'a>(
    document_id: &str,
    doc: &'a LoadedDocument,
    config: &ChunkConfig,
) -> Result<ChunkIter<'a>> {
    config.validate()?;
    Ok(ChunkIter {
        document_id: document_id.to_string(),
        pages: &doc.pages,
        config: *config,
        page_idx: 0,
        spans: None,
        pos: 0,
        next_index: 0,
    })
}

/// Iterator state for one chunking pass. See [`chunk_document`].
pub struct ChunkIter<'a> {
    document_id: String,
    pages: &'a [String],
    config: ChunkConfig,
    page_idx: usize,
    /// Token spans of the current page, computed on first use.
    spans: Option<Vec<(usize, usize)>>,
    /// Token index of the next chunk's first token within the current page.
    pos: usize,
    next_index: usize,
}

impl Iterator for ChunkIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            if self.page_idx >= self.pages.len() {
                return None;
            }
            let page_text = &self.pages[self.page_idx];
            let spans = self.spans.get_or_insert_with(|| token::spans(page_text));

            if self.pos >= spans.len() {
                self.page_idx += 1;
                self.spans = None;
                self.pos = 0;
                continue;
            }

            let n = spans.len();
            let max = self.config.max_tokens;
            let overlap = self.config.overlap_tokens;
            let cs = self.pos;
            let hard_end = (cs + max).min(n);

            // Snap back to the latest sentence end inside the window, but
            // never so far back that the next chunk would not advance.
            let ce = if hard_end == n {
                n
            } else {
                let mut snapped = hard_end;
                for t in ((cs + overlap + 1)..=hard_end).rev() {
                    let next_start = spans.get(t).map(|s| s.0);
                    if token::is_sentence_end(page_text, spans[t - 1], next_start) {
                        snapped = t;
                        break;
                    }
                }
                snapped
            };

            let start = spans[cs].0;
            let end = spans[ce - 1].1;
            let text = page_text[start..end].to_string();
            let chunk = Chunk {
                id: format!("{}#{}", self.document_id, self.next_index),
                document_id: self.document_id.clone(),
                index: self.next_index,
                page: self.page_idx + 1,
                hash: content_hash(&text),
                token_count: ce - cs,
                start_offset: start,
                end_offset: end,
                text,
            };
            self.next_index += 1;
            self.pos = if ce >= n { n } else { ce - overlap };
            return Some(chunk);
        }
    }
}
