//! Document loading: raw files in, page-structured plain text out.
//!
//! Supported formats: PDF (extracted page by page so citations can point at
//! "document X, page Y"), plain text, and Markdown (form-feed characters act
//! as page breaks, otherwise the whole file is one page). Loading is a pure
//! transformation — no network access, no mutation of the source.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// A document after extraction, before chunking. Immutable once produced.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Canonical source path the document was loaded from.
    pub source_path: String,
    /// Display title (file stem).
    pub title: String,
    /// Page texts in order. Pages are 1-based everywhere downstream.
    pub pages: Vec<String>,
}

/// Stable document id derived from the source path.
///
/// Re-ingesting the same file therefore reuses the same document id, which in
/// turn makes chunk ids stable and index upserts idempotent.
pub fn document_id(source_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Load a document from `path`.
///
/// # Errors
///
/// - [`RagError::UnsupportedFormat`] for unknown extensions.
/// - [`RagError::Extraction`] for unreadable or empty content.
pub fn load(path: &Path) -> Result<LoadedDocument> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let pages = match ext.as_str() {
        "pdf" => load_pdf(path)?,
        "txt" | "md" | "markdown" => load_text(path)?,
        _ => return Err(RagError::UnsupportedFormat(path.display().to_string())),
    };

    if pages.iter().all(|p| p.trim().is_empty()) {
        return Err(RagError::Extraction {
            path: path.display().to_string(),
            reason: "no text extracted".to_string(),
        });
    }

    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string();

    tracing::debug!(path = %path.display(), pages = pages.len(), "document loaded");

    Ok(LoadedDocument {
        source_path: path.display().to_string(),
        title,
        pages,
    })
}

fn load_pdf(path: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(path)?;
    pdf_extract::extract_text_from_mem_by_pages(&bytes).map_err(|e| RagError::Extraction {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn load_text(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| RagError::Extraction {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    // Form feed is the conventional page separator in plain-text exports.
    if text.contains('\u{0C}') {
        Ok(text.split('\u{0C}').map(|p| p.to_string()).collect())
    } else {
        Ok(vec![text])
    }
}
