//! The top-level engine: ingestion on one side, question answering on the
//! other, sharing one index and one embedding cache.
//!
//! Concurrency rules enforced here:
//!
//! - Ingestion of the same source path serializes on a per-document lock, so
//!   a re-ingest never interleaves its delete-then-insert with another.
//! - A question holds its session's lock for the whole ask. Two questions on
//!   one session run one after the other; different sessions run freely.
//! - Session state mutates only after generation succeeds. A failed ask
//!   leaves the conversation exactly as it was.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::answer::{Answer, Answerer, Generator};
use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding::{Embedder, EmbeddingService};
use crate::error::Result;
use crate::index::{DocumentRecord, IndexEntry, VectorIndex};
use crate::loader::{self, document_id};
use crate::prompt::assemble;
use crate::retrieve::Retriever;
use crate::session::{ConversationManager, Role, Turn};

/// Outcome of ingesting one source file.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub title: String,
    pub page_count: usize,
    pub chunk_count: usize,
}

/// Outcome of one question, with the session id the next question should use.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub session_id: String,
    pub answer: Answer,
}

pub struct RagEngine {
    config: Config,
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    retriever: Retriever,
    answerer: Answerer,
    sessions: ConversationManager,
    doc_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RagEngine {
    pub fn new(
        config: Config,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let embeddings = Arc::new(EmbeddingService::new(embedder, &config.embedding));
        let retriever = Retriever::new(
            index.clone(),
            embeddings.clone(),
            config.retrieval.clone(),
        );
        let answerer = Answerer::new(generator, &config.generation);
        let sessions =
            ConversationManager::new(config.session.clone(), config.budget.history_tokens);
        Self {
            config,
            index,
            embeddings,
            retriever,
            answerer,
            sessions,
            doc_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn doc_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ingest one document: extract, chunk, embed, then atomically replace
    /// whatever the index held for it. Re-ingesting an unchanged file ends in
    /// the identical index state.
    pub async fn ingest(&self, path: &Path) -> Result<IngestReport> {
        let doc = loader::load(path)?;
        let doc_id = document_id(&doc.source_path);
        tracing::info!(document = %doc_id, path = %doc.source_path, "ingesting");

        let chunks: Vec<_> =
            chunk_document(&doc_id, &doc, &self.config.chunking)?.collect();
        let vectors = self.embeddings.embed_chunks(&chunks).await?;

        // Replace under the per-document lock so concurrent re-ingests of the
        // same source cannot interleave.
        let lock = self.doc_lock(&doc_id);
        let _guard = lock.lock().await;

        self.index.delete_document(&doc_id).await?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            self.index
                .upsert(&IndexEntry {
                    chunk: chunk.clone(),
                    vector,
                })
                .await?;
        }
        self.index
            .record_document(&DocumentRecord {
                id: doc_id.clone(),
                source_path: doc.source_path.clone(),
                title: doc.title.clone(),
                page_count: doc.pages.len(),
                chunk_count: chunks.len(),
                ingested_at: chrono::Utc::now(),
            })
            .await?;

        tracing::info!(
            document = %doc_id,
            pages = doc.pages.len(),
            chunks = chunks.len(),
            "ingest complete"
        );
        Ok(IngestReport {
            document_id: doc_id,
            title: doc.title,
            page_count: doc.pages.len(),
            chunk_count: chunks.len(),
        })
    }

    /// Ingest every supported file under a directory. Files the loader
    /// rejects are logged and skipped; extraction or provider failures on a
    /// readable file still abort the run.
    pub async fn ingest_dir(&self, root: &Path) -> Result<Vec<IngestReport>> {
        let mut reports = Vec::new();
        for dent in walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            match self.ingest(dent.path()).await {
                Ok(report) => reports.push(report),
                Err(crate::error::RagError::UnsupportedFormat(_)) => {
                    tracing::debug!(path = %dent.path().display(), "skipping unsupported file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    /// Answer a question within a session. `session_id` of `None` starts a
    /// fresh conversation; the returned outcome carries the id to continue it.
    ///
    /// The session's turns are appended only after generation succeeds, so an
    /// aborted ask leaves no half-recorded exchange behind.
    pub async fn ask(&self, session_id: Option<&str>, question: &str) -> Result<AskOutcome> {
        self.sessions.expire_idle();

        let (id, handle) = self.sessions.session(session_id);
        let mut session = handle.lock().await;
        session.touch();

        let context = self
            .retriever
            .retrieve(question, self.config.budget.context_tokens)
            .await?;
        let history = session.history_for_prompt(self.config.budget.history_tokens);
        let prompt = assemble(
            &self.config.generation.system_prompt,
            &history,
            question,
            &context,
            &self.config.budget,
        );
        drop(history);

        tracing::debug!(
            session = %id,
            prompt_tokens = prompt.token_count,
            context_chunks = prompt.citations.len(),
            "asking"
        );
        let answer = self.answerer.answer(&prompt).await?;

        session.append(Turn::new(Role::User, question));
        session.append(Turn::new(Role::Assistant, answer.text.clone()));

        Ok(AskOutcome {
            session_id: id,
            answer,
        })
    }

    /// Forget a session's conversation.
    pub fn reset_session(&self, session_id: &str) -> Result<()> {
        if self.sessions.reset(session_id) {
            Ok(())
        } else {
            Err(crate::error::RagError::SessionNotFound(
                session_id.to_string(),
            ))
        }
    }

    pub async fn indexed_chunks(&self) -> Result<usize> {
        self.index.entry_count().await
    }

    /// Ingest metadata for a document, if it has been ingested.
    pub async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        self.index.document(document_id).await
    }
}
