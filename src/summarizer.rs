// ABOUTME: Conversation memory summarizer producing structured JSON digests of dropped turns
// ABOUTME: Degrades to an empty summary on any provider or parse failure rather than failing the turn
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Summarizer
//!
//! When a conversation thread grows past the history cap, the oldest turns
//! are folded into a [`MemorySummary`] that rides along in the system prompt
//! instead of the raw messages. The digest is produced by a small, cheap
//! model and is best-effort by design: summarization failures never block
//! the turn.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::catalog::Provider;
use crate::errors::AppError;
use crate::llm::{ChatMessage, ChatRequest, ProviderFactory};
use crate::models::MemorySummary;

/// Model used for summarization
const SUMMARY_MODEL: &str = "gpt-4o-mini";

/// Output cap for the digest
const SUMMARY_MAX_TOKENS: u32 = 600;

/// System prompt pinning the reply to bare JSON
const SUMMARY_SYSTEM_PROMPT: &str = "Return only JSON that matches the provided schema.";

/// Schema shown to the model verbatim
const SUMMARY_SCHEMA: &str = r#"{
  "summary": "2-4 sentences",
  "key_facts": ["fact"],
  "user_goal": "goal",
  "action_items": ["item"],
  "sentiment": "positive | neutral | negative | mixed",
  "entities": ["entity"],
  "last_updated": "ISO-8601 timestamp",
  "turn_count": 0
}"#;

/// Produces memory digests of dropped conversation turns
pub struct Summarizer {
    factory: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer").finish_non_exhaustive()
    }
}

impl Summarizer {
    /// Create a summarizer backed by the given provider factory
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self { factory }
    }

    /// Summarize dropped turns into a structured digest
    ///
    /// Provider failures and unparseable replies degrade to the empty
    /// summary with `last_updated` and `turn_count` still filled in.
    #[instrument(skip(self, messages), fields(dropped = messages.len()))]
    pub async fn summarize(&self, messages: &[ChatMessage]) -> MemorySummary {
        let summary = match self.request_summary(messages).await {
            Ok(summary) => {
                debug!("Summarized dropped turns");
                summary
            }
            Err(e) => {
                warn!(error = %e.message, "Summarization failed, using empty summary");
                MemorySummary::empty()
            }
        };

        backfill(summary, messages.len())
    }

    async fn request_summary(&self, messages: &[ChatMessage]) -> Result<MemorySummary, AppError> {
        let provider = self.factory.create(Provider::OpenAi)?;

        let request = ChatRequest::new(vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(messages)),
        ])
        .with_model(SUMMARY_MODEL)
        .with_max_tokens(SUMMARY_MAX_TOKENS);

        let response = provider.complete(&request).await?;

        let json = extract_json_block(&response.content)
            .ok_or_else(|| AppError::internal("Summarizer reply contained no JSON object"))?;

        serde_json::from_str(&json)
            .map_err(|e| AppError::internal(format!("Failed to parse summarizer reply: {e}")))
    }
}

/// Render the summarization prompt: schema first, then the transcript
fn build_prompt(messages: &[ChatMessage]) -> String {
    let transcript = messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Summarize the conversation memory as JSON with this schema:\n{SUMMARY_SCHEMA}\n\nConversation:\n{transcript}"
    )
}

/// Pull the JSON object out of a model reply
///
/// Prefers a fenced json code block; otherwise takes the slice from the
/// first `{` to the last `}`.
fn extract_json_block(content: &str) -> Option<String> {
    if let Some(start) = content.find("```json") {
        let after = &content[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_owned());
        }
    }

    let first = content.find('{')?;
    let last = content.rfind('}')?;
    if last < first {
        return None;
    }
    Some(content[first..=last].to_owned())
}

/// Fill derived fields the model commonly omits
fn backfill(mut summary: MemorySummary, turn_count: usize) -> MemorySummary {
    if summary.last_updated.is_empty() {
        summary.last_updated = Utc::now().to_rfc3339();
    }
    if summary.turn_count == 0 {
        summary.turn_count = turn_count as u32;
    }
    summary
}
