// ABOUTME: LLM provider abstraction layer for pluggable AI model integration
// ABOUTME: Defines the contract for LLM providers (OpenAI, Anthropic, Gemini) with streaming support
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # LLM Provider Interface
//!
//! This module defines the contract that LLM providers implement to serve
//! conversation turns. Each provider adapts one upstream API to a common
//! request/response shape plus a streaming variant.
//!
//! ## Key Concepts
//!
//! - **`LlmProvider`**: Async trait for chat completion with streaming support
//! - **`ChatMessage`**: Role-based message structure for conversations
//! - **`ChatProvider`**: Enum dispatching to the configured concrete provider
//!
//! ## Example: Using a Provider
//!
//! ```rust,no_run
//! use arbor_server::llm::{ChatMessage, ChatRequest, LlmProvider};
//!
//! async fn example(provider: &dyn LlmProvider) {
//!     let messages = vec![
//!         ChatMessage::system("You are a helpful AI assistant."),
//!         ChatMessage::user("Name three uses for a brick."),
//!     ];
//!
//!     let request = ChatRequest::new(messages);
//!     let response = provider.complete(&request).await;
//! }
//! ```

mod anthropic;
mod gemini;
pub mod invoker;
mod openai;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use invoker::{EnvProviderFactory, InvocationOutcome, ModelInvoker, ProviderFactory, TokenSink};
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::catalog::{Provider, ReasoningTier};
use crate::errors::AppError;

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction message
    System,
    /// User input message
    User,
    /// Assistant response message
    Assistant,
}

impl MessageRole {
    /// Convert to string representation for API calls
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a stored role string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Configuration for a chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation messages
    pub messages: Vec<ChatMessage>,
    /// Model identifier (provider-specific)
    pub model: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Reasoning tier, honored by providers that support it
    pub reasoning: Option<ReasoningTier>,
}

impl ChatRequest {
    /// Create a new chat request with messages
    #[must_use]
    pub const fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: None,
            reasoning: None,
        }
    }

    /// Set the model to use
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the maximum tokens
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the reasoning tier
    #[must_use]
    pub const fn with_reasoning(mut self, reasoning: Option<ReasoningTier>) -> Self {
        self.reasoning = reasoning;
        self
    }
}

/// Response from a chat completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated message content
    pub content: String,
    /// Model used for generation
    pub model: String,
    /// Token usage statistics
    pub usage: Option<TokenUsage>,
    /// Finish reason (stop, length, etc.)
    pub finish_reason: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

/// A chunk of a streaming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Content delta for this chunk
    pub delta: String,
    /// Whether this is the final chunk
    pub is_final: bool,
    /// Finish reason if final
    pub finish_reason: Option<String>,
}

/// Stream type for chat completion responses
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AppError>> + Send>>;

// ============================================================================
// Provider Trait
// ============================================================================

/// LLM provider trait for chat completion
///
/// Implement this trait to add a new LLM provider. The design follows the
/// async trait pattern for compatibility with the tokio runtime.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Unique provider identifier (e.g., "openai", "anthropic", "gemini")
    fn name(&self) -> &'static str;

    /// Human-readable display name for the provider
    fn display_name(&self) -> &'static str;

    /// Default model to use if not specified in request
    fn default_model(&self) -> &str;

    /// Perform a chat completion (non-streaming)
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError>;

    /// Perform a streaming chat completion
    ///
    /// Returns a stream of chunks that can be consumed incrementally.
    /// Providers without native streaming emit the full response as a
    /// single final chunk.
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError>;
}

// ============================================================================
// Provider Dispatch
// ============================================================================

/// Unified chat provider that wraps the concrete adapters
///
/// This enum provides a consistent interface regardless of which
/// underlying provider a turn is routed to.
pub enum ChatProvider {
    /// OpenAI chat completions API
    OpenAi(OpenAiProvider),
    /// Anthropic messages API
    Anthropic(AnthropicProvider),
    /// Google Gemini generateContent API
    Gemini(GeminiProvider),
}

impl ChatProvider {
    /// Create the adapter for a provider, reading its API key from the environment
    ///
    /// # Errors
    ///
    /// Returns a config error if the provider's API key variable is not set.
    pub fn for_provider(provider: Provider) -> Result<Self, AppError> {
        match provider {
            Provider::OpenAi => Ok(Self::OpenAi(OpenAiProvider::from_env()?)),
            Provider::Anthropic => Ok(Self::Anthropic(AnthropicProvider::from_env()?)),
            Provider::Gemini => Ok(Self::Gemini(GeminiProvider::from_env()?)),
        }
    }
}

impl std::fmt::Debug for ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi(_) => f.debug_tuple("ChatProvider::OpenAi").finish(),
            Self::Anthropic(_) => f.debug_tuple("ChatProvider::Anthropic").finish(),
            Self::Gemini(_) => f.debug_tuple("ChatProvider::Gemini").finish(),
        }
    }
}

#[async_trait]
impl LlmProvider for ChatProvider {
    fn name(&self) -> &'static str {
        match self {
            Self::OpenAi(p) => p.name(),
            Self::Anthropic(p) => p.name(),
            Self::Gemini(p) => p.name(),
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            Self::OpenAi(p) => p.display_name(),
            Self::Anthropic(p) => p.display_name(),
            Self::Gemini(p) => p.display_name(),
        }
    }

    fn default_model(&self) -> &str {
        match self {
            Self::OpenAi(p) => p.default_model(),
            Self::Anthropic(p) => p.default_model(),
            Self::Gemini(p) => p.default_model(),
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
        match self {
            Self::OpenAi(p) => p.complete(request).await,
            Self::Anthropic(p) => p.complete(request).await,
            Self::Gemini(p) => p.complete(request).await,
        }
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
        match self {
            Self::OpenAi(p) => p.complete_stream(request).await,
            Self::Anthropic(p) => p.complete_stream(request).await,
            Self::Gemini(p) => p.complete_stream(request).await,
        }
    }
}
