// ABOUTME: Database bootstrap, schema migration, and manager accessors
// ABOUTME: Owns the SqlitePool and creates the per-domain operation managers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Database Management
//!
//! The [`Database`] owns the connection pool and runs schema migration at
//! startup. Domain operations are grouped into small managers created on
//! demand; the pool is reference-counted, so handing each manager a clone is
//! cheap.

mod branches;
mod conversations;
mod messages;
mod usage;

pub use branches::{BranchManager, BranchRecord};
pub use conversations::{ConversationManager, ConversationRecord};
pub use messages::{MessageManager, MessageRecord, NewMessage};
pub use usage::UsageManager;

use anyhow::Result;
use sqlx::SqlitePool;

/// Database manager owning the connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migration fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Ensure SQLite creates the database file if it doesn't exist
        let connection_options = if database_url.starts_with("sqlite:") && !database_url.contains('?')
        {
            format!("{database_url}?mode=rwc")
        } else {
            database_url.to_owned()
        };

        let pool = SqlitePool::connect(&connection_options).await?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Get a reference to the pool for advanced operations
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Conversation operations
    #[must_use]
    pub fn conversations(&self) -> ConversationManager {
        ConversationManager::new(self.pool.clone())
    }

    /// Message operations
    #[must_use]
    pub fn messages(&self) -> MessageManager {
        MessageManager::new(self.pool.clone())
    }

    /// Branch operations
    #[must_use]
    pub fn branches(&self) -> BranchManager {
        BranchManager::new(self.pool.clone())
    }

    /// Daily usage counters
    #[must_use]
    pub fn usage(&self) -> UsageManager {
        UsageManager::new(self.pool.clone())
    }

    /// Run database migrations
    ///
    /// # Errors
    ///
    /// Returns an error if any migration statement fails.
    pub async fn migrate(&self) -> Result<()> {
        self.migrate_conversations().await?;
        self.migrate_messages().await?;
        self.migrate_branches().await?;
        self.migrate_usage().await?;
        Ok(())
    }

    async fn migrate_conversations(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                root_message_id TEXT,
                archived BOOLEAN NOT NULL DEFAULT false,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(user_id, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn migrate_messages(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                parent_message_id TEXT,
                branch_id TEXT,
                model_provider TEXT,
                model_name TEXT,
                reasoning_tier TEXT,
                request_id TEXT UNIQUE,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_message_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn migrate_branches(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS branches (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                parent_message_id TEXT NOT NULL,
                side TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_branches_fork ON branches(conversation_id, parent_message_id, side)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn migrate_usage(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS usage_stats (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
