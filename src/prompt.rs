//! Prompt assembly.
//!
//! Turns a system preamble, conversation history, retrieved context, and the
//! current question into one prompt string, enforcing the per-section token
//! budgets so the total never exceeds the model's context window. Every
//! context passage is tagged with a citation marker the answer can echo.

use serde::Deserialize;

use crate::error::{RagError, Result};
use crate::retrieve::ScoredChunk;
use crate::session::Turn;
use crate::token;

/// The `[budget]` config section: per-section token allowances.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptBudget {
    #[serde(default = "default_system_tokens")]
    pub system_tokens: usize,
    #[serde(default = "default_history_tokens")]
    pub history_tokens: usize,
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
    /// Total window of the downstream model. Sections must sum below this
    /// with room left for the question and the answer.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

fn default_system_tokens() -> usize {
    400
}
fn default_history_tokens() -> usize {
    1200
}
fn default_context_tokens() -> usize {
    2400
}
fn default_context_window() -> usize {
    8192
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self {
            system_tokens: default_system_tokens(),
            history_tokens: default_history_tokens(),
            context_tokens: default_context_tokens(),
            context_window: default_context_window(),
        }
    }
}

impl PromptBudget {
    pub fn validate(&self) -> Result<()> {
        let sections = self.system_tokens + self.history_tokens + self.context_tokens;
        if sections >= self.context_window {
            return Err(RagError::InvalidConfig(format!(
                "budget sections total {} tokens but context_window is {}",
                sections, self.context_window
            )));
        }
        Ok(())
    }
}

/// Where a context passage came from, carried through to the final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub document_id: String,
    pub page: usize,
    pub chunk_id: String,
}

impl Citation {
    /// The inline marker format used in prompts and answers.
    pub fn marker(&self) -> String {
        format!("[doc {} p.{}]", self.document_id, self.page)
    }
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    pub token_count: usize,
    pub citations: Vec<Citation>,
    /// True when no context passage made it in; the preamble then instructs
    /// the model to say it cannot answer from the corpus.
    pub empty_context: bool,
}

/// Default system instructions; override via `[generation] system_prompt`.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert on vehicles and road-traffic law. \
Answer only from the numbered context passages below. Cite every claim with the bracketed \
source marker of the passage it came from. If the passages do not contain the answer, say so \
plainly instead of guessing.";

const EMPTY_CONTEXT_NOTE: &str = "No relevant passages were found in the corpus for this \
question. State that you cannot answer it from the available documents, and do not invent \
legal content.";

/// Build the full prompt. `history` must already fit `budget.history_tokens`
/// (the session layer selects turns); context passages are cut off at
/// `budget.context_tokens`, keeping the highest-ranked ones. The question
/// itself is capped at the window headroom left after the three section
/// budgets, so an arbitrarily long question cannot push the prompt past
/// `budget.context_window`.
pub fn assemble(
    system_prompt: &str,
    history: &[&Turn],
    question: &str,
    context: &[ScoredChunk],
    budget: &PromptBudget,
) -> AssembledPrompt {
    let mut citations = Vec::new();
    let mut context_block = String::new();
    let mut context_used = 0usize;

    for sc in context {
        if context_used + sc.chunk.token_count > budget.context_tokens {
            continue;
        }
        context_used += sc.chunk.token_count;
        let citation = Citation {
            document_id: sc.chunk.document_id.clone(),
            page: sc.chunk.page,
            chunk_id: sc.chunk.id.clone(),
        };
        context_block.push_str(&format!(
            "[{}] {} {}\n",
            citations.len() + 1,
            citation.marker(),
            sc.chunk.text.trim()
        ));
        citations.push(citation);
    }

    let empty_context = citations.is_empty();

    let mut text = String::new();
    text.push_str(system_prompt);
    text.push_str("\n\n");
    if empty_context {
        text.push_str(EMPTY_CONTEXT_NOTE);
        text.push_str("\n\n");
    } else {
        text.push_str("Context passages:\n");
        text.push_str(&context_block);
        text.push('\n');
    }

    if !history.is_empty() {
        text.push_str("Conversation so far:\n");
        for turn in history {
            text.push_str(&format!("{}: {}\n", turn.role.label(), turn.text));
        }
        text.push('\n');
    }

    text.push_str("Question: ");
    text.push_str(capped_question(question, budget));

    let token_count = token::count(&text);
    AssembledPrompt {
        text,
        token_count,
        citations,
        empty_context,
    }
}

/// Cut the question down to the token headroom the section budgets leave in
/// the window. A validated budget always leaves at least one token of
/// headroom.
fn capped_question<'a>(question: &'a str, budget: &PromptBudget) -> &'a str {
    let question = question.trim();
    let headroom = budget
        .context_window
        .saturating_sub(budget.system_tokens + budget.history_tokens + budget.context_tokens)
        .max(1);
    let spans = token::spans(question);
    if spans.len() <= headroom {
        return question;
    }
    tracing::warn!(
        tokens = spans.len(),
        kept = headroom,
        "question exceeds window headroom, truncated"
    );
    &question[..spans[headroom - 1].1]
}
