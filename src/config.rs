// ABOUTME: Server configuration loaded from environment variables
// ABOUTME: Ports, database URL, quota timezone, and pipeline feature toggles
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use crate::errors::{AppError, AppResult};
use chrono_tz::Tz;
use std::env;

/// Runtime configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP API port
    pub http_port: u16,
    /// Database connection string
    pub database_url: String,
    /// Timezone used to bucket daily usage quotas
    pub quota_timezone: Tz,
    /// Skip the daily message quota entirely
    pub daily_limit_disabled: bool,
    /// Skip remote moderation calls (the fast gate still runs)
    pub moderation_disabled: bool,
    /// Serve a canned assistant reply instead of calling a provider
    pub canned_responses: bool,
    /// JSON array of regex strings overriding the built-in hard block rules
    pub fast_gate_rules: Option<String>,
}

impl ServerConfig {
    /// Environment variable for the HTTP port
    pub const HTTP_PORT_ENV: &'static str = "ARBOR_HTTP_PORT";

    /// Default HTTP port
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Environment variable for the database connection string
    pub const DATABASE_URL_ENV: &'static str = "DATABASE_URL";

    /// Default database location
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite:./data/arbor.db";

    /// Environment variable for the quota timezone (IANA name)
    pub const QUOTA_TIMEZONE_ENV: &'static str = "ARBOR_QUOTA_TIMEZONE";

    /// Environment variable disabling the daily message quota
    pub const DISABLE_DAILY_LIMIT_ENV: &'static str = "ARBOR_DISABLE_DAILY_LIMIT";

    /// Environment variable disabling remote moderation calls
    pub const DISABLE_MODERATION_ENV: &'static str = "ARBOR_DISABLE_MODERATION";

    /// Environment variable enabling canned assistant replies
    pub const CANNED_RESPONSES_ENV: &'static str = "ARBOR_CANNED_RESPONSES";

    /// Environment variable overriding the fast gate hard block rules
    pub const FAST_GATE_RULES_ENV: &'static str = "ARBOR_FAST_GATE_RULES";

    /// Load configuration from environment variables
    ///
    /// Unset variables fall back to defaults. The quota timezone is the one
    /// setting that fails loudly: a typo there would silently move every
    /// user's quota boundary, so an unparseable name rejects startup.
    ///
    /// # Errors
    ///
    /// Returns a config error if `ARBOR_QUOTA_TIMEZONE` is set to a value
    /// that is not a valid IANA timezone name.
    pub fn from_env() -> AppResult<Self> {
        let http_port = env::var(Self::HTTP_PORT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Self::DEFAULT_HTTP_PORT);

        let database_url = env::var(Self::DATABASE_URL_ENV)
            .unwrap_or_else(|_| Self::DEFAULT_DATABASE_URL.to_owned());

        let quota_timezone = match env::var(Self::QUOTA_TIMEZONE_ENV) {
            Ok(name) if !name.is_empty() => name.parse::<Tz>().map_err(|e| {
                AppError::config(format!(
                    "Invalid {} value {name:?}: {e}",
                    Self::QUOTA_TIMEZONE_ENV
                ))
            })?,
            _ => Tz::UTC,
        };

        Ok(Self {
            http_port,
            database_url,
            quota_timezone,
            daily_limit_disabled: env_flag(Self::DISABLE_DAILY_LIMIT_ENV),
            moderation_disabled: env_flag(Self::DISABLE_MODERATION_ENV),
            canned_responses: env_flag(Self::CANNED_RESPONSES_ENV),
            fast_gate_rules: env::var(Self::FAST_GATE_RULES_ENV)
                .ok()
                .filter(|s| !s.is_empty()),
        })
    }

    /// Human-readable configuration overview for startup logging
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Arbor Server Configuration:\n\
             - HTTP Port: {}\n\
             - Database: {}\n\
             - Quota Timezone: {}\n\
             - Daily Limit: {}\n\
             - Remote Moderation: {}\n\
             - Canned Responses: {}",
            self.http_port,
            self.database_url,
            self.quota_timezone,
            if self.daily_limit_disabled {
                "disabled"
            } else {
                "enabled"
            },
            if self.moderation_disabled {
                "disabled"
            } else {
                "enabled"
            },
            if self.canned_responses {
                "enabled"
            } else {
                "disabled"
            },
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: Self::DEFAULT_HTTP_PORT,
            database_url: Self::DEFAULT_DATABASE_URL.to_owned(),
            quota_timezone: Tz::UTC,
            daily_limit_disabled: false,
            moderation_disabled: false,
            canned_responses: false,
            fast_gate_rules: None,
        }
    }
}

/// Read a boolean toggle, true only for "true" or "1"
fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}
