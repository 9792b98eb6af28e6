// ABOUTME: Title generation for newly created conversations via a lightweight model call
// ABOUTME: Falls back to a content excerpt on any failure; runs detached so turns never wait on it
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::catalog::Provider;
use crate::database::ConversationManager;
use crate::errors::AppError;
use crate::llm::{ChatMessage, ChatRequest, ProviderFactory};

const TITLE_MODEL: &str = "gpt-4o-mini";

const TITLE_SYSTEM_PROMPT: &str =
    "Generate a concise chat title in the user's language. Return only the title.";

const TITLE_MAX_TOKENS: u32 = 40;

/// Longest excerpt taken from the content when the model call fails
pub const TITLE_MAX_CHARS: usize = 50;

/// Derives and stores titles for newly created conversations
///
/// New conversations start out titled with a truncated copy of the first
/// message. After the first turn persists, this replaces that placeholder
/// with a model-written title. The whole path is best effort; failures log
/// and leave the placeholder in place.
#[derive(Clone)]
pub struct TitleGenerator {
    factory: Arc<dyn ProviderFactory>,
    conversations: ConversationManager,
}

impl std::fmt::Debug for TitleGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TitleGenerator").finish_non_exhaustive()
    }
}

impl TitleGenerator {
    /// Create a title generator
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>, conversations: ConversationManager) -> Self {
        Self {
            factory,
            conversations,
        }
    }

    /// Generate a title from the first user message and store it
    ///
    /// Never fails the caller; model and database errors are logged.
    #[instrument(skip(self, content))]
    pub async fn assign(&self, conversation_id: &str, content: &str) {
        let title = self.generate(content).await;
        match self
            .conversations
            .update_title(conversation_id, &title)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(conversation_id = %conversation_id, "Title update matched no conversation");
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Failed to store title");
            }
        }
    }

    /// Model-written title, or a content excerpt on any failure
    async fn generate(&self, content: &str) -> String {
        match self.request_title(content).await {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => fallback_title(content),
            Err(e) => {
                warn!(error = %e, "Title generation failed, using content excerpt");
                fallback_title(content)
            }
        }
    }

    async fn request_title(&self, content: &str) -> Result<String, AppError> {
        let provider = self.factory.create(Provider::OpenAi)?;
        let request = ChatRequest::new(vec![
            ChatMessage::system(TITLE_SYSTEM_PROMPT),
            ChatMessage::user(content),
        ])
        .with_model(TITLE_MODEL)
        .with_max_tokens(TITLE_MAX_TOKENS);

        let response = provider.complete(&request).await?;
        Ok(response.content.trim().to_owned())
    }
}

/// First characters of the content, for when no model title is available
#[must_use]
pub fn fallback_title(content: &str) -> String {
    content.chars().take(TITLE_MAX_CHARS).collect()
}
