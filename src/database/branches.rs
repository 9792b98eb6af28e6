// ABOUTME: Database operations for branches forked off conversation messages
// ABOUTME: Create, lookup, and fork-point queries for the branch tree
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use crate::errors::{AppError, AppResult};
use crate::models::BranchSide;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Database representation of a branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Unique branch ID
    pub id: String,
    /// Conversation the branch belongs to
    pub conversation_id: String,
    /// Message the branch forks from
    pub parent_message_id: String,
    /// Which side of the fork this branch occupies (left, right)
    pub side: String,
    /// When the branch was created (ISO 8601)
    pub created_at: String,
}

/// Branch database operations manager
pub struct BranchManager {
    pool: SqlitePool,
}

impl BranchManager {
    /// Create a new branch manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a branch forking off a message
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn create(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        side: BranchSide,
    ) -> AppResult<BranchRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r"
            INSERT INTO branches (id, conversation_id, parent_message_id, side, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(parent_message_id)
        .bind(side.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create branch: {e}")))?;

        Ok(BranchRecord {
            id,
            conversation_id: conversation_id.to_owned(),
            parent_message_id: parent_message_id.to_owned(),
            side: side.as_str().to_owned(),
            created_at: now,
        })
    }

    /// Get a branch by ID
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn get(&self, branch_id: &str) -> AppResult<Option<BranchRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, conversation_id, parent_message_id, side, created_at
            FROM branches
            WHERE id = $1
            ",
        )
        .bind(branch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get branch: {e}")))?;

        Ok(row.map(|r| BranchRecord {
            id: r.get("id"),
            conversation_id: r.get("conversation_id"),
            parent_message_id: r.get("parent_message_id"),
            side: r.get("side"),
            created_at: r.get("created_at"),
        }))
    }

    /// Find the branch at a fork point, if one was already created
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn find_fork(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        side: BranchSide,
    ) -> AppResult<Option<BranchRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, conversation_id, parent_message_id, side, created_at
            FROM branches
            WHERE conversation_id = $1 AND parent_message_id = $2 AND side = $3
            ORDER BY created_at ASC
            LIMIT 1
            ",
        )
        .bind(conversation_id)
        .bind(parent_message_id)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to find branch fork: {e}")))?;

        Ok(row.map(|r| BranchRecord {
            id: r.get("id"),
            conversation_id: r.get("conversation_id"),
            parent_message_id: r.get("parent_message_id"),
            side: r.get("side"),
            created_at: r.get("created_at"),
        }))
    }

    /// List every branch in a conversation, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn list(&self, conversation_id: &str) -> AppResult<Vec<BranchRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, parent_message_id, side, created_at
            FROM branches
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list branches: {e}")))?;

        let branches = rows
            .into_iter()
            .map(|r| BranchRecord {
                id: r.get("id"),
                conversation_id: r.get("conversation_id"),
                parent_message_id: r.get("parent_message_id"),
                side: r.get("side"),
                created_at: r.get("created_at"),
            })
            .collect();

        Ok(branches)
    }
}
