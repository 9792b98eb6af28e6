// ABOUTME: Google Gemini LLM provider implementation using the Generative Language API
// ABOUTME: Serves as the long-context detour target when primary models overflow
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Gemini Provider
//!
//! Implementation of the `LlmProvider` trait for Google's Gemini models.
//!
//! ## Configuration
//!
//! Set the `GEMINI_API_KEY` environment variable with your API key from
//! Google AI Studio: <https://aistudio.google.com/apikey>
//!
//! Gemini's wire format differs from the others: system prompts travel in
//! `systemInstruction`, assistant turns use the `"model"` role, and the API
//! key rides in the URL query string rather than a header.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use super::{
    ChatMessage, ChatRequest, ChatResponse, ChatStream, LlmProvider, MessageRole, StreamChunk,
    TokenUsage,
};
use crate::errors::AppError;

/// Environment variable for Gemini API key
const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Default model to use
const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Base URL for the Generative Language API
const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Gemini API request structure
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

/// A content block in Gemini format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

/// A single part within a content block
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

/// Generation parameters
#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

/// Gemini API response structure
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

/// Candidate in Gemini response
#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

/// Usage metadata in Gemini response
#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt: Option<u32>,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates: Option<u32>,
    #[serde(rename = "totalTokenCount", default)]
    total: Option<u32>,
}

/// Error payload in Gemini response
#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Google Gemini LLM provider
///
/// Last entry in the fallback chain and the target of the long-context
/// detour, since Gemini accepts substantially larger prompts.
pub struct GeminiProvider {
    client: Client,
    api_key: String,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl GeminiProvider {
    /// Create a new Gemini provider with the given API key
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    /// Create a Gemini provider from environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if `GEMINI_API_KEY` is not set
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = std::env::var(GEMINI_API_KEY_ENV).map_err(|_| {
            AppError::config(format!(
                "Missing {GEMINI_API_KEY_ENV} environment variable. Get your API key from https://aistudio.google.com/apikey"
            ))
        })?;

        Ok(Self::new(api_key))
    }

    /// Build the API URL for a model and method, with the key in the query
    fn build_url(&self, model: &str, method: &str) -> String {
        format!(
            "{API_BASE_URL}/models/{model}:{method}?key={}",
            self.api_key
        )
    }

    /// Map our message role to Gemini's role tag
    ///
    /// System messages are carried via `systemInstruction`; one appearing
    /// here maps to "user" for compatibility.
    const fn convert_role(role: MessageRole) -> &'static str {
        match role {
            MessageRole::System | MessageRole::User => "user",
            MessageRole::Assistant => "model",
        }
    }

    /// Convert chat messages to Gemini format
    fn convert_messages(messages: &[ChatMessage]) -> (Vec<GeminiContent>, Option<GeminiContent>) {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        for message in messages {
            if message.role == MessageRole::System {
                system_instruction = Some(GeminiContent {
                    role: None,
                    parts: vec![ContentPart {
                        text: Some(message.content.clone()),
                    }],
                });
            } else {
                contents.push(GeminiContent {
                    role: Some(Self::convert_role(message.role).to_owned()),
                    parts: vec![ContentPart {
                        text: Some(message.content.clone()),
                    }],
                });
            }
        }

        (contents, system_instruction)
    }

    /// Build a Gemini API request from a `ChatRequest`
    fn build_gemini_request(request: &ChatRequest) -> GeminiRequest {
        let (contents, system_instruction) = Self::convert_messages(&request.messages);

        let generation_config = request.max_tokens.map(|max_output_tokens| GenerationConfig {
            max_output_tokens: Some(max_output_tokens),
        });

        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }

    /// Join text parts from the first candidate
    fn extract_content(response: &GeminiResponse) -> Result<String, AppError> {
        let content = response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if content.is_empty() {
            return Err(AppError::model_unavailable(
                "Gemini API returned no text content",
            ));
        }

        Ok(content)
    }

    /// Convert usage metadata to our token usage format
    fn convert_usage(metadata: &UsageMetadata) -> TokenUsage {
        TokenUsage {
            prompt_tokens: metadata.prompt.unwrap_or(0),
            completion_tokens: metadata.candidates.unwrap_or(0),
            total_tokens: metadata.total.unwrap_or(0),
        }
    }

    /// Parse error response from Gemini API
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        let message = serde_json::from_str::<GeminiResponse>(body)
            .ok()
            .and_then(|r| r.error)
            .map_or_else(
                || body.chars().take(200).collect::<String>(),
                |e| e.message,
            );

        match status.as_u16() {
            401 | 403 => AppError::model_unavailable(format!(
                "Gemini API authentication failed: {message}"
            )),
            429 => {
                AppError::model_unavailable(format!("Gemini rate limit exceeded: {message}"))
            }
            _ => AppError::model_unavailable(format!("Gemini API error ({status}): {message}")),
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn display_name(&self) -> &'static str {
        "Google Gemini"
    }

    fn default_model(&self) -> &'static str {
        DEFAULT_MODEL
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let url = self.build_url(model, "generateContent");

        let gemini_request = Self::build_gemini_request(request);

        debug!("Sending request to Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&gemini_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send request to Gemini API: {}", e);
                AppError::model_unavailable(format!("Gemini request failed: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read Gemini API response: {}", e);
            AppError::model_unavailable(format!("Failed to read Gemini response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(status, &body));
        }

        let gemini_response: GeminiResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse Gemini API response: {}", e);
            AppError::model_unavailable(format!("Failed to parse Gemini response: {e}"))
        })?;

        if let Some(error) = gemini_response.error {
            return Err(AppError::model_unavailable(format!(
                "Gemini API error: {}",
                error.message
            )));
        }

        let content = Self::extract_content(&gemini_response)?;
        let usage = gemini_response
            .usage_metadata
            .as_ref()
            .map(Self::convert_usage);
        let finish_reason = gemini_response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.finish_reason.clone());

        debug!(
            "Received response from Gemini: {} chars, finish_reason: {:?}",
            content.len(),
            finish_reason
        );

        Ok(ChatResponse {
            content,
            model: model.to_owned(),
            usage,
            finish_reason,
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
