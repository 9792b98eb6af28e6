// ABOUTME: Closed model-provider catalog with reasoning tiers and fallback ordering
// ABOUTME: Defines Provider, ReasoningTier, and ModelSelection used by the validator and invoker

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! Model catalog shared by the request validator and the model invoker.
//!
//! The provider set is a closed enumeration. Adding a provider means adding a
//! variant here and an adapter in `llm/`; the compiler then points at every
//! dispatch site that needs updating.

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

/// Supported model providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI chat completions API
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Google Gemini generateContent API
    Gemini,
}

impl Provider {
    /// Parse a provider tag, returning `None` for anything outside the closed set
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Canonical lowercase tag, as stored alongside messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// Reasoning effort tier for models that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningTier {
    /// Minimal deliberation
    Low,
    /// Balanced deliberation
    Medium,
    /// Maximum deliberation
    High,
}

impl ReasoningTier {
    /// Parse a reasoning tier, returning `None` for unknown values
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Canonical lowercase tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl Display for ReasoningTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// A fully resolved model choice for one turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Which provider serves the model
    pub provider: Provider,
    /// Provider-side model name
    pub name: String,
    /// Optional reasoning tier (honored by providers that support it)
    pub reasoning: Option<ReasoningTier>,
}

impl ModelSelection {
    /// Create a selection without a reasoning tier
    #[must_use]
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
            reasoning: None,
        }
    }

    /// System default used when neither the request nor the conversation
    /// history carries a valid selection
    #[must_use]
    pub fn system_default() -> Self {
        Self::new(Provider::OpenAi, DEFAULT_MODEL)
    }

    /// The designated long-context model tried once after a context-window failure
    #[must_use]
    pub fn long_context() -> Self {
        Self::new(Provider::Gemini, LONG_CONTEXT_MODEL)
    }
}

impl Display for ModelSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Default model when nothing else is resolved
pub const DEFAULT_MODEL: &str = "gpt-5.2";

/// Long-context model used after a context-length failure
pub const LONG_CONTEXT_MODEL: &str = "gemini-2.5-pro";

/// Models a request may select explicitly
///
/// Fallback models need not appear here; this list only gates what clients
/// ask for by name.
pub const SELECTABLE_MODELS: &[(Provider, &str)] = &[
    (Provider::OpenAi, "gpt-5.2"),
    (Provider::Anthropic, "claude-opus-4-5"),
    (Provider::Anthropic, "claude-sonnet-4-5"),
    (Provider::Gemini, "gemini-3-pro-preview"),
    (Provider::Gemini, "gemini-3-flash-preview"),
];

/// Whether a provider/model pair may be requested explicitly
#[must_use]
pub fn is_selectable(provider: Provider, name: &str) -> bool {
    SELECTABLE_MODELS
        .iter()
        .any(|&(p, n)| p == provider && n == name)
}

/// Fixed preference order tried after the primary selection fails
pub const FALLBACK_ORDER: &[(Provider, &str)] = &[
    (Provider::OpenAi, "gpt-4.1-latest"),
    (Provider::Anthropic, "claude-sonnet-4-5"),
    (Provider::Gemini, "gemini-2.5-pro"),
];

/// Build the ordered candidate list for one invocation: the primary selection
/// followed by the fallback order minus any duplicate of the primary.
#[must_use]
pub fn fallback_candidates(primary: &ModelSelection) -> Vec<ModelSelection> {
    let mut candidates = vec![primary.clone()];
    for &(provider, name) in FALLBACK_ORDER {
        if provider == primary.provider && name == primary.name {
            continue;
        }
        candidates.push(ModelSelection::new(provider, name));
    }
    candidates
}
