// ABOUTME: Daily message quota enforcement for constrained plans
// ABOUTME: Computes the quota day in the configured timezone and checks counts against the limit
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use chrono::Utc;
use chrono_tz::Tz;
use tracing::debug;

use crate::database::UsageManager;
use crate::errors::AppError;
use crate::models::PlanTier;

/// Messages a constrained plan may send per quota day
pub const DAILY_MESSAGE_LIMIT: i64 = 10;

/// Enforces the per-day message quota
///
/// Paid plans and disabled enforcement pass without a database read.
/// The quota day rolls over at midnight in the configured timezone,
/// not UTC, so the limit resets when users expect it to.
pub struct UsageGate {
    usage: UsageManager,
    timezone: Tz,
    disabled: bool,
}

impl std::fmt::Debug for UsageGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageGate")
            .field("timezone", &self.timezone)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl UsageGate {
    /// Create a usage gate
    #[must_use]
    pub const fn new(usage: UsageManager, timezone: Tz, disabled: bool) -> Self {
        Self {
            usage,
            timezone,
            disabled,
        }
    }

    /// The current quota day as `YYYY-MM-DD` in the configured timezone
    #[must_use]
    pub fn quota_day(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Reject the turn if the user is over their daily limit
    ///
    /// # Errors
    ///
    /// Returns a quota error when the limit is reached, or a database
    /// error if the usage read fails.
    pub async fn check(&self, user_id: &str, plan: PlanTier) -> Result<(), AppError> {
        if self.disabled || !plan.is_constrained() {
            return Ok(());
        }

        let day = self.quota_day();
        let sent = self.usage.messages_sent(user_id, &day).await?;
        if sent >= DAILY_MESSAGE_LIMIT {
            debug!(user_id = %user_id, day = %day, sent = sent, "Daily message limit reached");
            return Err(AppError::quota_exceeded("Daily message limit reached"));
        }

        Ok(())
    }

    /// Count one sent message against a constrained plan's quota
    ///
    /// Paid plans are not metered. Recording still happens when
    /// enforcement is disabled so counts stay accurate.
    ///
    /// # Errors
    ///
    /// Returns an error if the usage write fails.
    pub async fn record(&self, user_id: &str, plan: PlanTier) -> Result<(), AppError> {
        if !plan.is_constrained() {
            return Ok(());
        }

        let day = self.quota_day();
        self.usage.increment(user_id, &day).await
    }
}
