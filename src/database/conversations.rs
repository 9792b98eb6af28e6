// ABOUTME: Database operations for conversations (create, lookup, list, archive)
// ABOUTME: Owner-scoped queries plus root-pointer and title maintenance
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Database representation of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Unique conversation ID
    pub id: String,
    /// User ID who owns the conversation
    pub user_id: String,
    /// Conversation title (derived from the first message until generated)
    pub title: String,
    /// ID of the first main-thread message, set once on first persist
    pub root_message_id: Option<String>,
    /// Soft-delete flag; archived conversations are hidden from listings
    pub archived: bool,
    /// When the conversation was created (ISO 8601)
    pub created_at: String,
    /// When the conversation was last updated (ISO 8601)
    pub updated_at: String,
}

/// Conversation database operations manager
#[derive(Clone)]
pub struct ConversationManager {
    pool: SqlitePool,
}

impl ConversationManager {
    /// Create a new conversation manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new conversation
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn create(&self, user_id: &str, title: &str) -> AppResult<ConversationRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r"
            INSERT INTO conversations (id, user_id, title, root_message_id, archived, created_at, updated_at)
            VALUES ($1, $2, $3, NULL, false, $4, $4)
            ",
        )
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create conversation: {e}")))?;

        Ok(ConversationRecord {
            id,
            user_id: user_id.to_owned(),
            title: title.to_owned(),
            root_message_id: None,
            archived: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a conversation by ID, scoped to its owner
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn get(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Option<ConversationRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, title, root_message_id, archived, created_at, updated_at
            FROM conversations
            WHERE id = $1 AND user_id = $2
            ",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get conversation: {e}")))?;

        Ok(row.map(|r| ConversationRecord {
            id: r.get("id"),
            user_id: r.get("user_id"),
            title: r.get("title"),
            root_message_id: r.get("root_message_id"),
            archived: r.get("archived"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// List a user's active conversations, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn list(&self, user_id: &str) -> AppResult<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, title, root_message_id, archived, created_at, updated_at
            FROM conversations
            WHERE user_id = $1 AND archived = false
            ORDER BY updated_at DESC
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list conversations: {e}")))?;

        let conversations = rows
            .into_iter()
            .map(|r| ConversationRecord {
                id: r.get("id"),
                user_id: r.get("user_id"),
                title: r.get("title"),
                root_message_id: r.get("root_message_id"),
                archived: r.get("archived"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect();

        Ok(conversations)
    }

    /// Set the root message pointer if it has not been set yet
    ///
    /// The guard keeps a replayed or concurrent first turn from repointing
    /// the conversation root.
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn set_root_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> AppResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE conversations
            SET root_message_id = $1, updated_at = $2
            WHERE id = $3 AND root_message_id IS NULL
            ",
        )
        .bind(message_id)
        .bind(&now)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to set root message: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Update the conversation title
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn update_title(&self, conversation_id: &str, title: &str) -> AppResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE conversations
            SET title = $1, updated_at = $2
            WHERE id = $3
            ",
        )
        .bind(title)
        .bind(&now)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to update conversation title: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Bump the conversation's `updated_at` after new messages land
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn touch(&self, conversation_id: &str) -> AppResult<()> {
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(&now)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to touch conversation: {e}")))?;

        Ok(())
    }

    /// Archive a conversation, scoped to its owner
    ///
    /// Archived conversations stay readable by ID but drop out of listings.
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn archive(&self, conversation_id: &str, user_id: &str) -> AppResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE conversations
            SET archived = true, updated_at = $1
            WHERE id = $2 AND user_id = $3
            ",
        )
        .bind(&now)
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to archive conversation: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}
