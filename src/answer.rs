//! Answer generation.
//!
//! [`Generator`] mirrors [`crate::embedding::Embedder`]: one provider
//! attempt, no policy. [`HttpGenerator`] speaks an OpenAI-compatible chat
//! completions endpoint. [`Answerer`] wraps a generator with bounded retry
//! and packages the model output together with the citations the prompt was
//! built from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{RagError, Result};
use crate::prompt::AssembledPrompt;
use crate::token;

/// The `[generation]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_answer_tokens")]
    pub max_answer_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// System instructions prepended to every prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_answer_tokens() -> usize {
    700
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_system_prompt() -> String {
    crate::prompt::DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            max_answer_tokens: default_max_answer_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_answer_tokens == 0 {
            return Err(RagError::InvalidConfig(
                "generation.max_answer_tokens must be > 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RagError::InvalidConfig(
                "generation.temperature must be in [0.0, 2.0]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Text-generation capability: one attempt per call, retry lives in
/// [`Answerer`].
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat completions provider. API key comes from
/// `OPENAI_API_KEY`.
pub struct HttpGenerator {
    endpoint: String,
    model: String,
    max_answer_tokens: usize,
    temperature: f32,
    api_key: String,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
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
            max_answer_tokens: config.max_answer_tokens,
            temperature: config.temperature,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.max_answer_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Generation {
                attempts: 1,
                retryable: true,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            // Same classification as the embedder: retry 429 and 5xx, fail
            // fast on other client errors.
            return Err(RagError::Generation {
                attempts: 1,
                retryable: status.as_u16() == 429 || status.is_server_error(),
                reason: format!("HTTP {}: {}", status, body_text),
            });
        }

        let json: serde_json::Value = response.json().await.map_err(|e| RagError::Generation {
            attempts: 1,
            retryable: false,
            reason: e.to_string(),
        })?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| RagError::Generation {
                attempts: 1,
                retryable: false,
                reason: "response missing choices[0].message.content".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// A generated answer plus the provenance of its supporting context.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<crate::prompt::Citation>,
    pub usage: TokenUsage,
    /// Set when the prompt carried no retrieved context, so the answer is a
    /// refusal rather than a grounded response.
    pub low_confidence: bool,
}

/// Retry policy around a [`Generator`].
pub struct Answerer {
    provider: Arc<dyn Generator>,
    max_retries: u32,
    backoff_ms: u64,
}

impl Answerer {
    pub fn new(provider: Arc<dyn Generator>, config: &GenerationConfig) -> Self {
        Self {
            provider,
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
        }
    }

    /// Generate an answer for an assembled prompt. Transient provider
    /// failures retry with exponential backoff; non-retryable rejections
    /// stop after the first attempt. Exhaustion surfaces
    /// [`RagError::Generation`] with the attempt count.
    pub async fn answer(&self, prompt: &AssembledPrompt) -> Result<Answer> {
        let mut last_reason = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(self.backoff_ms << (attempt - 1).min(5));
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "generation retry");
                tokio::time::sleep(delay).await;
            }
            match self.provider.generate(&prompt.text).await {
                Ok(text) => {
                    let usage = TokenUsage {
                        prompt_tokens: prompt.token_count,
                        completion_tokens: token::count(&text),
                    };
                    return Ok(Answer {
                        text,
                        citations: prompt.citations.clone(),
                        usage,
                        low_confidence: prompt.empty_context,
                    });
                }
                Err(RagError::Generation {
                    retryable: false,
                    reason,
                    ..
                }) => {
                    return Err(RagError::Generation {
                        attempts: attempt + 1,
                        retryable: false,
                        reason,
                    });
                }
                Err(e) => last_reason = e.to_string(),
            }
        }
        Err(RagError::Generation {
            attempts: self.max_retries + 1,
            retryable: true,
            reason: last_reason,
        })
    }
}
