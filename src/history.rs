// ABOUTME: Conversation history assembly for one turn, following branch parent chains
// ABOUTME: Compacts threads over the history cap into a memory summary and enforces the token budget
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # History Builder
//!
//! Assembles the model-facing message history for a turn. Without a parent
//! message the main thread is used; with one, the parent chain is walked
//! from the branch point back to the conversation root, so branches only
//! see their own ancestry.
//!
//! Threads longer than [`MAX_HISTORY_MESSAGES`] are compacted: the oldest
//! overflow is folded into a [`MemorySummary`] and only the newest messages
//! are sent. A separate character-based token budget is applied later, once
//! the user content and summary sizes are known.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, instrument};

use crate::database::{MessageManager, MessageRecord};
use crate::errors::AppError;
use crate::llm::{ChatMessage, MessageRole};
use crate::models::MemorySummary;
use crate::summarizer::Summarizer;

/// Most messages ever sent to the model verbatim
pub const MAX_HISTORY_MESSAGES: usize = 40;

/// Character-estimate token budget for one invocation
pub const TOKEN_BUDGET: usize = 8000;

/// History assembled for one turn
#[derive(Debug)]
pub struct TurnHistory {
    /// Messages to send, oldest first
    pub messages: Vec<ChatMessage>,
    /// Digest of turns dropped by compaction, when any were
    pub summary: Option<MemorySummary>,
}

/// Builds per-turn history from stored messages
pub struct HistoryBuilder {
    messages: MessageManager,
    summarizer: Summarizer,
}

impl std::fmt::Debug for HistoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryBuilder").finish_non_exhaustive()
    }
}

impl HistoryBuilder {
    /// Create a history builder
    #[must_use]
    pub const fn new(messages: MessageManager, summarizer: Summarizer) -> Self {
        Self {
            messages,
            summarizer,
        }
    }

    /// Assemble the history for one turn
    ///
    /// # Errors
    ///
    /// Returns an error if loading messages fails. Summarization failures
    /// do not propagate; they degrade to an empty summary.
    #[instrument(skip(self))]
    pub async fn build(
        &self,
        conversation_id: &str,
        parent_message_id: Option<&str>,
    ) -> Result<TurnHistory, AppError> {
        let records = match parent_message_id {
            None => self.messages.main_thread(conversation_id).await?,
            Some(parent_id) => self.parent_chain(conversation_id, parent_id).await?,
        };

        let mut messages: Vec<ChatMessage> = records.iter().filter_map(record_to_chat).collect();

        let summary = if messages.len() > MAX_HISTORY_MESSAGES {
            let overflow = messages.len() - MAX_HISTORY_MESSAGES;
            debug!(
                overflow = overflow,
                "History over cap, compacting oldest turns"
            );
            let digest = self.summarizer.summarize(&messages[..overflow]).await;
            messages.drain(..overflow);
            Some(digest)
        } else {
            None
        };

        Ok(TurnHistory { messages, summary })
    }

    /// Walk the parent chain from a branch point back to the root
    ///
    /// The chain ends silently at the first missing parent, so a pruned
    /// ancestor truncates history instead of failing the turn.
    async fn parent_chain(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
    ) -> Result<Vec<MessageRecord>, AppError> {
        let all = self.messages.list_for_conversation(conversation_id).await?;
        let by_id: HashMap<&str, &MessageRecord> =
            all.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut chain = VecDeque::new();
        let mut cursor = Some(parent_message_id);
        while let Some(id) = cursor {
            let Some(message) = by_id.get(id) else {
                break;
            };
            chain.push_front((*message).clone());
            cursor = message.parent_message_id.as_deref();
        }

        Ok(chain.into())
    }
}

/// Convert a stored record to a chat message, skipping unknown roles
fn record_to_chat(record: &MessageRecord) -> Option<ChatMessage> {
    let role = MessageRole::parse(&record.role)?;
    Some(ChatMessage::new(role, record.content.clone()))
}

/// Rough token estimate: four characters per token, rounded up
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Drop oldest history messages until the turn fits the token budget
///
/// The user content and summary always count against the budget; only
/// history messages are dropped, oldest first.
#[must_use]
pub fn trim_to_token_budget(
    mut history: Vec<ChatMessage>,
    user_content: &str,
    summary_json: Option<&str>,
    budget: usize,
) -> Vec<ChatMessage> {
    let fixed = estimate_tokens(user_content) + summary_json.map_or(0, estimate_tokens);
    let mut total = fixed
        + history
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<usize>();

    while total > budget && !history.is_empty() {
        let removed = history.remove(0);
        total -= estimate_tokens(&removed.content);
    }

    history
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::Provider;
    use crate::database::{Database, NewMessage};
    use crate::llm::{ChatRequest, ChatResponse, ChatStream, LlmProvider, ProviderFactory, StreamChunk};

    struct StubProvider {
        reply: String,
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn display_name(&self) -> &'static str {
            "Stub"
        }

        fn default_model(&self) -> &'static str {
            "stub-1"
        }

        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
            Ok(ChatResponse {
                content: self.reply.clone(),
                model: request.model.clone().unwrap_or_default(),
                usage: None,
                finish_reason: Some("stop".to_owned()),
            })
        }

        async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
            let response = self.complete(request).await?;
            Ok(Box::pin(tokio_stream::once(Ok(StreamChunk {
                delta: response.content,
                is_final: true,
                finish_reason: response.finish_reason,
            }))))
        }
    }

    struct StubFactory {
        reply: String,
    }

    impl ProviderFactory for StubFactory {
        fn create(&self, _provider: Provider) -> Result<Box<dyn LlmProvider>, AppError> {
            Ok(Box::new(StubProvider {
                reply: self.reply.clone(),
            }))
        }
    }

    async fn test_setup(summary_reply: &str) -> (Database, HistoryBuilder) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let summarizer = Summarizer::new(Arc::new(StubFactory {
            reply: summary_reply.to_owned(),
        }));
        let builder = HistoryBuilder::new(db.messages(), summarizer);
        (db, builder)
    }

    async fn insert_message(
        db: &Database,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        parent: Option<&str>,
        branch: Option<&str>,
    ) -> MessageRecord {
        db.messages()
            .insert(NewMessage {
                conversation_id,
                role,
                content,
                parent_message_id: parent,
                branch_id: branch,
                model_provider: None,
                model_name: None,
                reasoning_tier: None,
                request_id: None,
            })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_main_thread_history_in_order() {
        let (db, builder) = test_setup("{}").await;
        let conversation = db.conversations().create("user-1", "chat").await.unwrap();

        let m1 = insert_message(&db, &conversation.id, MessageRole::User, "first", None, None).await;
        let m2 = insert_message(
            &db,
            &conversation.id,
            MessageRole::Assistant,
            "second",
            Some(&m1.id),
            None,
        )
        .await;
        insert_message(
            &db,
            &conversation.id,
            MessageRole::User,
            "third",
            Some(&m2.id),
            None,
        )
        .await;

        let history = builder.build(&conversation.id, None).await.unwrap();

        assert!(history.summary.is_none());
        let contents: Vec<&str> = history
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_main_thread_excludes_branch_messages() {
        let (db, builder) = test_setup("{}").await;
        let conversation = db.conversations().create("user-1", "chat").await.unwrap();

        let m1 = insert_message(&db, &conversation.id, MessageRole::User, "main", None, None).await;
        insert_message(
            &db,
            &conversation.id,
            MessageRole::User,
            "on a branch",
            Some(&m1.id),
            Some("branch-1"),
        )
        .await;

        let history = builder.build(&conversation.id, None).await.unwrap();

        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].content, "main");
    }

    #[tokio::test]
    async fn test_parent_chain_walks_branch_ancestry() {
        let (db, builder) = test_setup("{}").await;
        let conversation = db.conversations().create("user-1", "chat").await.unwrap();

        let m1 = insert_message(&db, &conversation.id, MessageRole::User, "root", None, None).await;
        let m2 = insert_message(
            &db,
            &conversation.id,
            MessageRole::Assistant,
            "reply",
            Some(&m1.id),
            None,
        )
        .await;
        // A sibling continuation on the main thread, not part of the branch ancestry
        insert_message(
            &db,
            &conversation.id,
            MessageRole::User,
            "later main turn",
            Some(&m2.id),
            None,
        )
        .await;

        let history = builder.build(&conversation.id, Some(&m2.id)).await.unwrap();

        let contents: Vec<&str> = history
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["root", "reply"]);
    }

    #[tokio::test]
    async fn test_parent_chain_stops_at_missing_ancestor() {
        let (db, builder) = test_setup("{}").await;
        let conversation = db.conversations().create("user-1", "chat").await.unwrap();

        // Parent chain points at an ID that does not exist
        let orphan = insert_message(
            &db,
            &conversation.id,
            MessageRole::User,
            "orphan",
            Some("missing-parent"),
            None,
        )
        .await;

        let history = builder
            .build(&conversation.id, Some(&orphan.id))
            .await
            .unwrap();

        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].content, "orphan");
    }

    #[tokio::test]
    async fn test_long_thread_is_compacted_with_summary() {
        let (db, builder) = test_setup(r#"{"summary": "early turns"}"#).await;
        let conversation = db.conversations().create("user-1", "chat").await.unwrap();

        let mut parent: Option<String> = None;
        for i in 0..43 {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            let record = insert_message(
                &db,
                &conversation.id,
                role,
                &format!("turn {i}"),
                parent.as_deref(),
                None,
            )
            .await;
            parent = Some(record.id);
        }

        let history = builder.build(&conversation.id, None).await.unwrap();

        assert_eq!(history.messages.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(history.messages[0].content, "turn 3");
        let summary = history.summary.unwrap();
        assert_eq!(summary.summary, "early turns");
        assert_eq!(summary.turn_count, 3);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_trim_keeps_fitting_history() {
        let history = vec![
            ChatMessage::user("short"),
            ChatMessage::assistant("also short"),
        ];
        let trimmed = trim_to_token_budget(history.clone(), "hello", None, TOKEN_BUDGET);
        assert_eq!(trimmed.len(), history.len());
    }

    #[test]
    fn test_trim_drops_oldest_first() {
        let history = vec![
            ChatMessage::user("a".repeat(400)),
            ChatMessage::assistant("b".repeat(400)),
            ChatMessage::user("c".repeat(400)),
        ];
        // Budget fits two messages plus the user content, not three
        let trimmed = trim_to_token_budget(history, "hi", None, 210);

        assert_eq!(trimmed.len(), 2);
        assert!(trimmed[0].content.starts_with('b'));
    }

    #[test]
    fn test_trim_counts_user_content_and_summary() {
        let history = vec![ChatMessage::user("a".repeat(400))];

        // Alone the message fits
        let kept = trim_to_token_budget(history.clone(), "hi", None, 110);
        assert_eq!(kept.len(), 1);

        // A large summary squeezes it out
        let summary = "s".repeat(400);
        let trimmed = trim_to_token_budget(history, "hi", Some(&summary), 110);
        assert!(trimmed.is_empty());
    }

    #[test]
    fn test_trim_never_drops_below_empty() {
        let history = vec![ChatMessage::user("tiny")];
        let oversized_content = "x".repeat(100_000);
        let trimmed = trim_to_token_budget(history, &oversized_content, None, TOKEN_BUDGET);
        assert!(trimmed.is_empty());
    }
}
