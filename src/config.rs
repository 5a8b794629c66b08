use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::answer::GenerationConfig;
use crate::chunk::ChunkConfig;
use crate::embedding::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::prompt::PromptBudget;
use crate::session::SessionConfig;

/// Top-level configuration, loaded from a TOML file. Every section has
/// defaults so a minimal config (or none at all for in-memory use) works.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub budget: PromptBudget,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("roadwise.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks handed to the prompt assembler.
    #[serde(default = "default_k")]
    pub k: usize,
    /// The index is queried for `k * overfetch_factor` candidates so that
    /// budget filtering still has material to choose from.
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// Weight of the lexical overlap term in the blended score, in [0, 1].
    /// Zero disables lexical re-ranking entirely.
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            overfetch_factor: default_overfetch_factor(),
            lexical_weight: default_lexical_weight(),
        }
    }
}

fn default_k() -> usize {
    6
}
fn default_overfetch_factor() -> usize {
    4
}
fn default_lexical_weight() -> f32 {
    0.25
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(RagError::InvalidConfig(
                "retrieval.k must be >= 1".to_string(),
            ));
        }
        if self.overfetch_factor == 0 {
            return Err(RagError::InvalidConfig(
                "retrieval.overfetch_factor must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lexical_weight) {
            return Err(RagError::InvalidConfig(
                "retrieval.lexical_weight must be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| RagError::InvalidConfig(format!("failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.retrieval.validate()?;
        self.budget.validate()?;
        self.session.validate()?;
        self.embedding.validate()?;
        self.generation.validate()?;

        let system = crate::token::count(&self.generation.system_prompt);
        if system > self.budget.system_tokens {
            return Err(RagError::InvalidConfig(format!(
                "generation.system_prompt is {} tokens but budget.system_tokens is {}",
                system, self.budget.system_tokens
            )));
        }
        Ok(())
    }
}
