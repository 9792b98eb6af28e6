// ABOUTME: Database operations for per-user daily usage counters
// ABOUTME: Read and upsert message counts keyed by (user, calendar day)
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use crate::errors::{AppError, AppResult};
use sqlx::{Row, SqlitePool};

/// Daily usage counter operations manager
pub struct UsageManager {
    pool: SqlitePool,
}

impl UsageManager {
    /// Create a new usage manager
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the number of messages a user sent on a given day
    ///
    /// A missing row counts as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn messages_sent(&self, user_id: &str, day: &str) -> AppResult<i64> {
        let row = sqlx::query(
            "SELECT message_count FROM usage_stats WHERE user_id = $1 AND day = $2",
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to read usage: {e}")))?;

        Ok(row.map_or(0, |r| r.get("message_count")))
    }

    /// Record one more message for a user on a given day
    ///
    /// # Errors
    ///
    /// Returns an error if database operation fails
    pub async fn increment(&self, user_id: &str, day: &str) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO usage_stats (user_id, day, message_count)
            VALUES ($1, $2, 1)
            ON CONFLICT(user_id, day) DO UPDATE SET message_count = message_count + 1
            ",
        )
        .bind(user_id)
        .bind(day)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to record usage: {e}")))?;

        Ok(())
    }
}
