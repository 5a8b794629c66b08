//! # Roadwise
//!
//! A retrieval-augmented answering engine for road-traffic law questions.
//!
//! Roadwise ingests statute and regulation documents (PDF, text, Markdown),
//! chunks and embeds them into a local SQLite vector index, and answers
//! questions grounded in the retrieved passages, with page-level citations
//! and per-session conversation history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────┐
//! │  Loader  │──▶│  Chunk+Embed  │──▶│  SQLite   │
//! │ PDF/text │   │   pipeline    │   │  vectors  │
//! └──────────┘   └───────────────┘   └─────┬─────┘
//!                                          │
//!            ┌───────────┐   ┌──────────┐  │
//! question ─▶│  Session  │──▶│ Retrieve │◀─┘
//!            │  history  │   │ +re-rank │
//!            └─────┬─────┘   └────┬─────┘
//!                  └───── Prompt ─┘
//!                           │
//!                       ┌───▼────┐
//!                       │ Answer │ (citations, token usage)
//!                       └────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! roadwise init                          # create the database
//! roadwise ingest ./statutes/road-act.pdf
//! roadwise ask "Can I park on a bridge?"
//! ```
//!
//! Multi-turn conversations are a library feature: sessions live in process
//! memory, so follow-up questions go through [`RagEngine::ask`] with the
//! session id of an earlier turn inside the same process. Each CLI run
//! starts with no sessions.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`loader`] | PDF and plain-text extraction into page texts |
//! | [`chunk`] | Token-window chunking with sentence-aligned overlap |
//! | [`embedding`] | Embedding provider, cache, and retry policy |
//! | [`index`] | Vector index backends (SQLite, in-memory) |
//! | [`retrieve`] | Candidate search and blended re-ranking |
//! | [`session`] | Conversation sessions and history budgets |
//! | [`prompt`] | Prompt assembly with citation markers |
//! | [`answer`] | Answer generation with bounded retry |
//! | [`engine`] | Ingestion and ask orchestration |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod loader;
pub mod prompt;
pub mod retrieve;
pub mod session;
pub mod token;

pub use engine::RagEngine;
pub use error::{RagError, Result};
