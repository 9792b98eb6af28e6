// ABOUTME: OpenAI LLM provider implementation with native SSE streaming
// ABOUTME: Primary conversation provider; supports reasoning effort tiers on capable models
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # OpenAI Provider
//!
//! Implementation of the `LlmProvider` trait for OpenAI's chat completions API.
//!
//! ## Configuration
//!
//! Set the `OPENAI_API_KEY` environment variable with your API key from
//! the OpenAI platform: <https://platform.openai.com/api-keys>
//!
//! ## Reasoning Tiers
//!
//! Requests carrying a [`ReasoningTier`](crate::catalog::ReasoningTier) are
//! sent with the `reasoning_effort` field. Models that do not support the
//! field reject the request, so callers only attach a tier to models
//! validated against the catalog.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::sse::{
    create_sse_stream, is_retryable_request_error, is_retryable_status, RetryConfig,
};
use super::{
    ChatMessage, ChatRequest, ChatResponse, ChatStream, LlmProvider, StreamChunk, TokenUsage,
};
use crate::errors::AppError;

/// Environment variable for OpenAI API key
const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Default model to use
const DEFAULT_MODEL: &str = "gpt-5.2";

/// Base URL for the OpenAI API
const API_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// API Request/Response Types
// ============================================================================

/// OpenAI chat completions request structure
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// Message structure for the OpenAI API
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for OpenAiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

/// OpenAI chat completions response structure
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    model: String,
}

/// Choice in OpenAI response
#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

/// Message in OpenAI response
#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

/// Usage statistics in OpenAI response
#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    /// Tokens used in the prompt
    #[serde(rename = "prompt_tokens")]
    prompt: u32,
    /// Tokens generated in completion
    #[serde(rename = "completion_tokens")]
    completion: u32,
    /// Total tokens used
    #[serde(rename = "total_tokens")]
    total: u32,
}

/// Streaming chunk structure
#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

/// Choice in streaming chunk
#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

/// Delta content in streaming chunk
#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI API error response
#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// OpenAI LLM provider
///
/// The primary provider for conversation turns. Supports native SSE
/// streaming and reasoning effort tiers on capable models.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    /// Create a new OpenAI provider with the given API key
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    /// Create an OpenAI provider from environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not set
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = std::env::var(OPENAI_API_KEY_ENV).map_err(|_| {
            AppError::config(format!(
                "Missing {OPENAI_API_KEY_ENV} environment variable. Get your API key from https://platform.openai.com/api-keys"
            ))
        })?;

        Ok(Self::new(api_key))
    }

    /// Build the API URL for a given endpoint
    fn api_url(endpoint: &str) -> String {
        format!("{API_BASE_URL}/{endpoint}")
    }

    /// Convert internal messages to OpenAI format
    fn convert_messages(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
        messages.iter().map(OpenAiMessage::from).collect()
    }

    /// Build an OpenAI API request from a `ChatRequest`
    fn build_request(request: &ChatRequest, stream: bool) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.as_deref().unwrap_or(DEFAULT_MODEL).to_owned(),
            messages: Self::convert_messages(&request.messages),
            max_tokens: request.max_tokens,
            reasoning_effort: request.reasoning.map(|tier| tier.as_str().to_owned()),
            stream: Some(stream),
        }
    }

    /// Parse error response from OpenAI API
    ///
    /// The upstream error message passes through intact. Callers inspect it
    /// for rate limit and context window phrasing when deciding how to retry.
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        if let Ok(error_response) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            let error_type = error_response
                .error
                .error_type
                .unwrap_or_else(|| "unknown".to_owned());

            match status.as_u16() {
                401 | 403 => AppError::model_unavailable(format!(
                    "OpenAI API authentication failed: {}",
                    error_response.error.message
                )),
                429 => AppError::model_unavailable(format!(
                    "OpenAI rate limit exceeded: {}",
                    error_response.error.message
                )),
                _ => AppError::model_unavailable(format!(
                    "OpenAI API error ({error_type}): {}",
                    error_response.error.message
                )),
            }
        } else {
            AppError::model_unavailable(format!(
                "OpenAI API error ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            ))
        }
    }

    /// Send a request, retrying transient failures with exponential backoff
    ///
    /// Retries cover connection errors, timeouts, and 429/502/503 statuses.
    /// Anything else returns immediately.
    async fn send_with_retry(&self, request: &OpenAiRequest) -> Result<reqwest::Response, AppError> {
        let config = RetryConfig::default_config();
        let mut attempt = 0_u32;

        loop {
            let result = self
                .client
                .post(Self::api_url("chat/completions"))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if is_retryable_status(status) && attempt < config.max_retries {
                        let delay = config.delay_for_attempt(attempt);
                        warn!(
                            status = status,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "OpenAI returned retryable status, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) if is_retryable_request_error(&e) && attempt < config.max_retries => {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "OpenAI request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to send request to OpenAI API: {}", e);
                    return Err(AppError::model_unavailable(format!(
                        "OpenAI request failed: {e}"
                    )));
                }
            }
        }
    }

    /// Parse one SSE data payload into a stream chunk
    fn parse_stream_data(data: &str) -> Option<Result<StreamChunk, AppError>> {
        match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(chunk) => chunk.choices.into_iter().next().map(|choice| {
                Ok(StreamChunk {
                    delta: choice.delta.content.unwrap_or_default(),
                    is_final: choice.finish_reason.is_some(),
                    finish_reason: choice.finish_reason,
                })
            }),
            Err(e) => {
                warn!("Failed to parse OpenAI stream chunk: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn display_name(&self) -> &'static str {
        "OpenAI"
    }

    fn default_model(&self) -> &'static str {
        DEFAULT_MODEL
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
        debug!("Sending chat completion request to OpenAI");

        let openai_request = Self::build_request(request, false);
        let response = self.send_with_retry(&openai_request).await?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read OpenAI API response: {}", e);
            AppError::model_unavailable(format!("Failed to read OpenAI response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(status, &body));
        }

        let openai_response: OpenAiResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse OpenAI API response: {}", e);
            AppError::model_unavailable(format!("Failed to parse OpenAI response: {e}"))
        })?;

        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::model_unavailable("OpenAI API returned no choices"))?;

        let content = choice.message.content.unwrap_or_default();

        debug!(
            "Received response from OpenAI: {} chars, finish_reason: {:?}",
            content.len(),
            choice.finish_reason
        );

        Ok(ChatResponse {
            content,
            model: openai_response.model,
            usage: openai_response.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt,
                completion_tokens: u.completion,
                total_tokens: u.total,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
        debug!("Sending streaming chat completion request to OpenAI");

        let openai_request = Self::build_request(request, true);
        let response = self.send_with_retry(&openai_request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        Ok(create_sse_stream(
            response.bytes_stream(),
            Self::parse_stream_data,
            "OpenAI",
        ))
    }
}
