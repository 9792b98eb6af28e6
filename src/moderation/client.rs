// ABOUTME: Remote moderation scoring client backed by the OpenAI moderations endpoint
// ABOUTME: Defines the provider trait tests substitute and the score conversion types
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Moderation Client
//!
//! Scores content against the OpenAI moderations API. The same
//! `OPENAI_API_KEY` used by the OpenAI chat provider authenticates requests.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::errors::AppError;

/// Environment variable holding the API key (shared with the chat provider)
const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Moderation model requested for every scoring call
const MODERATION_MODEL: &str = "omni-moderation-latest";

/// Moderations API endpoint
const API_URL: &str = "https://api.openai.com/v1/moderations";

/// Category scores for one piece of content
#[derive(Debug, Clone, Default)]
pub struct ModerationScores {
    /// Whether the API flagged the content outright
    pub flagged: bool,
    /// Categories the API marked as violated, sorted for stable output
    pub flagged_categories: Vec<String>,
    /// Raw per-category scores in `[0, 1]`
    pub category_scores: HashMap<String, f64>,
}

/// Remote moderation scoring
///
/// The seam that lets pipeline tests substitute scripted scores for live
/// API calls.
#[async_trait]
pub trait ModerationProvider: Send + Sync {
    /// Score one piece of content
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` when the moderation service cannot be
    /// reached or rejects the request.
    async fn score(&self, input: &str) -> Result<ModerationScores, AppError>;
}

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Moderations API request structure
#[derive(Debug, Serialize)]
struct ModerationApiRequest {
    model: String,
    input: String,
}

/// Moderations API response structure
#[derive(Debug, Deserialize)]
struct ModerationApiResponse {
    results: Vec<ModerationApiResult>,
}

/// One scored result
#[derive(Debug, Deserialize)]
struct ModerationApiResult {
    flagged: bool,
    #[serde(default)]
    categories: HashMap<String, bool>,
    #[serde(default)]
    category_scores: HashMap<String, f64>,
}

impl ModerationApiResult {
    fn into_scores(self) -> ModerationScores {
        let mut flagged_categories: Vec<String> = self
            .categories
            .into_iter()
            .filter_map(|(category, violated)| violated.then_some(category))
            .collect();
        flagged_categories.sort();

        ModerationScores {
            flagged: self.flagged,
            flagged_categories,
            category_scores: self.category_scores,
        }
    }
}

/// Moderation API error response
#[derive(Debug, Deserialize)]
struct ModerationErrorResponse {
    error: ModerationErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct ModerationErrorDetail {
    message: String,
}

// ============================================================================
// Client Implementation
// ============================================================================

/// OpenAI-backed moderation client
pub struct ModerationClient {
    client: Client,
    api_key: String,
}

impl std::fmt::Debug for ModerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationClient")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl ModerationClient {
    /// Create a new moderation client with the given API key
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    /// Create a moderation client from environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not set
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = std::env::var(OPENAI_API_KEY_ENV).map_err(|_| {
            AppError::config(format!(
                "Missing {OPENAI_API_KEY_ENV} environment variable, required for moderation"
            ))
        })?;

        Ok(Self::new(api_key))
    }

    /// Parse error response from the moderations API
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        let message = serde_json::from_str::<ModerationErrorResponse>(body).map_or_else(
            |_| body.chars().take(200).collect::<String>(),
            |e| e.error.message,
        );

        match status.as_u16() {
            401 | 403 => AppError::model_unavailable(format!(
                "Moderation API authentication failed: {message}"
            )),
            429 => AppError::model_unavailable(format!(
                "Moderation API rate limit exceeded: {message}"
            )),
            _ => AppError::model_unavailable(format!("Moderation API error ({status}): {message}")),
        }
    }
}

#[async_trait]
impl ModerationProvider for ModerationClient {
    #[instrument(skip(self, input), fields(chars = input.len()))]
    async fn score(&self, input: &str) -> Result<ModerationScores, AppError> {
        let request = ModerationApiRequest {
            model: MODERATION_MODEL.to_owned(),
            input: input.to_owned(),
        };

        let response = self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send moderation request: {}", e);
                AppError::model_unavailable(format!("Moderation request failed: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read moderation response: {}", e);
            AppError::model_unavailable(format!("Failed to read moderation response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(status, &body));
        }

        let api_response: ModerationApiResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse moderation response: {}", e);
            AppError::model_unavailable(format!("Failed to parse moderation response: {e}"))
        })?;

        let result = api_response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AppError::model_unavailable("Moderation API returned no results"))?;

        Ok(result.into_scores())
    }
}
