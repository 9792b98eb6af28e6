// ABOUTME: Database operations for messages in the conversation tree
// ABOUTME: Insert with idempotency guard, parent-chain lookups, thread listings
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use crate::errors::{AppError, AppResult};
use crate::llm::MessageRole;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Database representation of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message ID
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Role of the message sender (user, assistant)
    pub role: String,
    /// Message content
    pub content: String,
    /// Parent message in the conversation tree, `None` for roots
    pub parent_message_id: Option<String>,
    /// Branch this message lives on, `None` for the main thread
    pub branch_id: Option<String>,
    /// Provider that produced or was requested for this turn
    pub model_provider: Option<String>,
    /// Model name that produced or was requested for this turn
    pub model_name: Option<String>,
    /// Reasoning tier requested for this turn
    pub reasoning_tier: Option<String>,
    /// Client-supplied idempotency key, set on user messages only
    pub request_id: Option<String>,
    /// When the message was created (ISO 8601)
    pub created_at: String,
}

/// Parameters for inserting a message
#[derive(Debug, Clone, Copy)]
pub struct NewMessage<'a> {
    /// Conversation the message belongs to
    pub conversation_id: &'a str,
    /// Sender role
    pub role: MessageRole,
    /// Message content
    pub content: &'a str,
    /// Parent message in the tree
    pub parent_message_id: Option<&'a str>,
    /// Branch the message lives on
    pub branch_id: Option<&'a str>,
    /// Provider recorded for this turn
    pub model_provider: Option<&'a str>,
    /// Model name recorded for this turn
    pub model_name: Option<&'a str>,
    /// Reasoning tier recorded for this turn
    pub reasoning_tier: Option<&'a str>,
    /// Idempotency key, user messages only
    pub request_id: Option<&'a str>,
}

/// Message database operations manager
pub struct MessageManager {
    pool: SqlitePool,
}

impl MessageManager {
    /// Create a new message manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message
    ///
    /// Returns `Ok(None)` when the request ID is already taken, which means
    /// a concurrent or replayed turn won the insert. Callers re-read the
    /// winner's rows in that case instead of writing a duplicate.
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn insert(&self, new: NewMessage<'_>) -> AppResult<Option<MessageRecord>> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            INSERT INTO messages (id, conversation_id, role, content, parent_message_id, branch_id,
                                  model_provider, model_name, reasoning_tier, request_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(&id)
        .bind(new.conversation_id)
        .bind(new.role.as_str())
        .bind(new.content)
        .bind(new.parent_message_id)
        .bind(new.branch_id)
        .bind(new.model_provider)
        .bind(new.model_name)
        .bind(new.reasoning_tier)
        .bind(new.request_id)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Some(MessageRecord {
                id,
                conversation_id: new.conversation_id.to_owned(),
                role: new.role.as_str().to_owned(),
                content: new.content.to_owned(),
                parent_message_id: new.parent_message_id.map(ToOwned::to_owned),
                branch_id: new.branch_id.map(ToOwned::to_owned),
                model_provider: new.model_provider.map(ToOwned::to_owned),
                model_name: new.model_name.map(ToOwned::to_owned),
                reasoning_tier: new.reasoning_tier.map(ToOwned::to_owned),
                request_id: new.request_id.map(ToOwned::to_owned),
                created_at: now,
            })),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(AppError::database(format!("Failed to insert message: {e}"))),
        }
    }

    /// Look up a user message by its idempotency key
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn get_by_request_id(&self, request_id: &str) -> AppResult<Option<MessageRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, parent_message_id, branch_id,
                   model_provider, model_name, reasoning_tier, request_id, created_at
            FROM messages
            WHERE request_id = $1
            ",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to look up request: {e}")))?;

        Ok(row.map(|r| row_to_message(&r)))
    }

    /// Find the assistant reply hanging off a user message
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn find_assistant_child(
        &self,
        parent_message_id: &str,
    ) -> AppResult<Option<MessageRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, parent_message_id, branch_id,
                   model_provider, model_name, reasoning_tier, request_id, created_at
            FROM messages
            WHERE parent_message_id = $1 AND role = 'assistant'
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
            ",
        )
        .bind(parent_message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to find assistant reply: {e}")))?;

        Ok(row.map(|r| row_to_message(&r)))
    }

    /// List the main thread of a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn main_thread(&self, conversation_id: &str) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, parent_message_id, branch_id,
                   model_provider, model_name, reasoning_tier, request_id, created_at
            FROM messages
            WHERE conversation_id = $1 AND branch_id IS NULL
            ORDER BY created_at ASC, rowid ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to load main thread: {e}")))?;

        Ok(rows.into_iter().map(|r| row_to_message(&r)).collect())
    }

    /// List every message in a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn list_for_conversation(
        &self,
        conversation_id: &str,
    ) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, parent_message_id, branch_id,
                   model_provider, model_name, reasoning_tier, request_id, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC, rowid ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list messages: {e}")))?;

        Ok(rows.into_iter().map(|r| row_to_message(&r)).collect())
    }

    /// Get the most recently created message in a conversation
    ///
    /// Used to inherit the model selection from the previous turn.
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn latest(&self, conversation_id: &str) -> AppResult<Option<MessageRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, parent_message_id, branch_id,
                   model_provider, model_name, reasoning_tier, request_id, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            ",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get latest message: {e}")))?;

        Ok(row.map(|r| row_to_message(&r)))
    }

    /// Check whether any message has landed on a branch
    ///
    /// A branch with no messages is still open for its first turn; one with
    /// messages is committed.
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn branch_has_messages(&self, branch_id: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM messages WHERE branch_id = $1")
            .bind(branch_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to count branch messages: {e}")))?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }
}

fn row_to_message(r: &SqliteRow) -> MessageRecord {
    MessageRecord {
        id: r.get("id"),
        conversation_id: r.get("conversation_id"),
        role: r.get("role"),
        content: r.get("content"),
        parent_message_id: r.get("parent_message_id"),
        branch_id: r.get("branch_id"),
        model_provider: r.get("model_provider"),
        model_name: r.get("model_name"),
        reasoning_tier: r.get("reasoning_tier"),
        request_id: r.get("request_id"),
        created_at: r.get("created_at"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
