// ABOUTME: Anthropic Claude provider implementation using the Messages API
// ABOUTME: First fallback provider; emits full responses as single stream chunks
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Anthropic Provider
//!
//! Implementation of the `LlmProvider` trait for Anthropic's Messages API.
//!
//! ## Configuration
//!
//! Set the `ANTHROPIC_API_KEY` environment variable with your API key from
//! the Anthropic console: <https://console.anthropic.com/settings/keys>
//!
//! System messages are carried in the dedicated `system` request field
//! rather than the messages array, per the Messages API contract.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use super::{
    ChatMessage, ChatRequest, ChatResponse, ChatStream, LlmProvider, MessageRole, StreamChunk,
    TokenUsage,
};
use crate::errors::AppError;

/// Environment variable for Anthropic API key
const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Default model to use
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Messages API endpoint
const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Required API version header value
const API_VERSION: &str = "2023-06-01";

/// The Messages API requires `max_tokens`; used when the request omits it
const DEFAULT_MAX_TOKENS: u32 = 1024;

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Anthropic Messages API request structure
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

/// Message structure for the Messages API (user/assistant only)
#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

/// Anthropic Messages API response structure
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

/// Content block in Anthropic response
#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

/// Usage statistics in Anthropic response
#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Anthropic API error response
#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Anthropic Claude LLM provider
///
/// First entry in the fallback chain. The Messages API has no SSE path
/// here, so streaming callers receive the full response as one final chunk.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with the given API key
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    /// Create an Anthropic provider from environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if `ANTHROPIC_API_KEY` is not set
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = std::env::var(ANTHROPIC_API_KEY_ENV).map_err(|_| {
            AppError::config(format!(
                "Missing {ANTHROPIC_API_KEY_ENV} environment variable. Get your API key from https://console.anthropic.com/settings/keys"
            ))
        })?;

        Ok(Self::new(api_key))
    }

    /// Split messages into the `system` field and the messages array
    ///
    /// The Messages API rejects `system` roles inside the array. When
    /// several system messages appear, the last one wins.
    fn convert_messages(messages: &[ChatMessage]) -> (Vec<AnthropicMessage>, Option<String>) {
        let mut converted = Vec::new();
        let mut system = None;

        for message in messages {
            if message.role == MessageRole::System {
                system = Some(message.content.clone());
            } else {
                converted.push(AnthropicMessage {
                    role: message.role.as_str().to_owned(),
                    content: message.content.clone(),
                });
            }
        }

        (converted, system)
    }

    /// Build an Anthropic API request from a `ChatRequest`
    fn build_request(request: &ChatRequest) -> AnthropicRequest {
        let (messages, system) = Self::convert_messages(&request.messages);

        AnthropicRequest {
            model: request.model.as_deref().unwrap_or(DEFAULT_MODEL).to_owned(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages,
        }
    }

    /// Join text blocks from the response content array
    fn extract_content(response: &AnthropicResponse) -> Result<String, AppError> {
        let content = response
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(AppError::model_unavailable(
                "Anthropic API returned no text content",
            ));
        }

        Ok(content)
    }

    /// Parse error response from Anthropic API
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error_type = error_response
                .error
                .error_type
                .unwrap_or_else(|| "unknown".to_owned());

            match status.as_u16() {
                401 | 403 => AppError::model_unavailable(format!(
                    "Anthropic API authentication failed: {}",
                    error_response.error.message
                )),
                429 => AppError::model_unavailable(format!(
                    "Anthropic rate limit exceeded: {}",
                    error_response.error.message
                )),
                _ => AppError::model_unavailable(format!(
                    "Anthropic API error ({error_type}): {}",
                    error_response.error.message
                )),
            }
        } else {
            AppError::model_unavailable(format!(
                "Anthropic API error ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            ))
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn display_name(&self) -> &'static str {
        "Anthropic Claude"
    }

    fn default_model(&self) -> &'static str {
        DEFAULT_MODEL
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
        debug!("Sending messages request to Anthropic");

        let anthropic_request = Self::build_request(request);

        let response = self
            .client
            .post(API_URL)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&anthropic_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send request to Anthropic API: {}", e);
                AppError::model_unavailable(format!("Anthropic request failed: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read Anthropic API response: {}", e);
            AppError::model_unavailable(format!("Failed to read Anthropic response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(status, &body));
        }

        let anthropic_response: AnthropicResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse Anthropic API response: {}", e);
            AppError::model_unavailable(format!("Failed to parse Anthropic response: {e}"))
        })?;

        let content = Self::extract_content(&anthropic_response)?;

        debug!(
            "Received response from Anthropic: {} chars, stop_reason: {:?}",
            content.len(),
            anthropic_response.stop_reason
        );

        Ok(ChatResponse {
            content,
            model: anthropic_response.model,
            usage: anthropic_response.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            }),
            finish_reason: anthropic_response.stop_reason,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
        let response = self.complete(request).await?;

        let chunk = StreamChunk {
            delta: response.content,
            is_final: true,
            finish_reason: response.finish_reason,
        };

        Ok(Box::pin(tokio_stream::once(Ok(chunk))))
    }
}
