//! Error taxonomy for the answering core.
//!
//! Every fallible operation in the crate returns [`RagError`]. Provider
//! failures (`EmbeddingProvider`, `Generation`) are only surfaced after the
//! bounded retry loop has been exhausted and carry the attempt count.
//! An empty retrieval result is *not* an error — see
//! [`Answer::low_confidence`](crate::answer::Answer).

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum RagError {
    /// The file extension is not one the loader understands.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The file was recognized but its content could not be extracted.
    #[error("extraction failed for {path}: {reason}")]
    Extraction { path: String, reason: String },

    /// Configuration violated a validation rule (e.g. overlap >= max_tokens).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The embedding provider failed; `attempts` includes the initial call.
    /// `retryable` is false for rejections a retry cannot fix (4xx other
    /// than 429, malformed responses), in which case the retry loop stops
    /// after the first attempt.
    #[error("embedding provider failed after {attempts} attempt(s): {reason}")]
    EmbeddingProvider {
        attempts: u32,
        retryable: bool,
        reason: String,
    },

    /// The generation provider failed; same retry classification as
    /// [`RagError::EmbeddingProvider`].
    #[error("generation failed after {attempts} attempt(s): {reason}")]
    Generation {
        attempts: u32,
        retryable: bool,
        reason: String,
    },

    /// A stored vector has no backing chunk row. Fatal, never silently
    /// repaired.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// A session id referred to no live session (e.g. on reset).
    #[error("no such session: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;
