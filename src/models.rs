// ABOUTME: Core domain types for branching conversations and turn processing
// ABOUTME: Defines PlanTier, BranchSide, MemorySummary, and the turn request/outcome types
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Domain Models
//!
//! Shared vocabulary for the turn pipeline. Storage records live next to
//! their managers in [`crate::database`]; this module holds the types that
//! cross module boundaries: the inbound turn request, the completed turn
//! outcome, and the small closed enumerations attached to both.

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

use crate::catalog::ModelSelection;
use crate::database::{ConversationRecord, MessageRecord};

/// Account plan tier, forwarded by the fronting proxy with each request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    /// Constrained tier subject to the daily message quota (default)
    #[default]
    Free,
    /// Paid tier without daily quota enforcement
    Pro,
}

impl PlanTier {
    /// Parse a plan tag; anything other than `free` is treated as unconstrained
    #[must_use]
    pub fn from_str_or_default(s: &str) -> Self {
        if s.eq_ignore_ascii_case("free") {
            Self::Free
        } else {
            Self::Pro
        }
    }

    /// Whether the daily quota applies to this tier
    #[must_use]
    pub const fn is_constrained(self) -> bool {
        matches!(self, Self::Free)
    }
}

impl Display for PlanTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
        }
    }
}

/// Which side of an assistant message a branch forks toward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchSide {
    /// Fork placed to the left of the parent on the canvas
    Left,
    /// Fork placed to the right of the parent on the canvas
    Right,
}

impl BranchSide {
    /// Parse a side tag, returning `None` for unknown values
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    /// Canonical lowercase tag as stored in the branch row
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl Display for BranchSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// Structured digest substituted for turns dropped during history compaction
///
/// Produced by the summarizer within a single turn and never persisted.
/// Every field defaults to empty so an unparseable model reply degrades to a
/// harmless no-op summary instead of failing the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemorySummary {
    /// Free-text summary of the dropped turns
    #[serde(default)]
    pub summary: String,
    /// Standalone facts worth carrying forward
    #[serde(default)]
    pub key_facts: Vec<String>,
    /// What the user appears to be trying to accomplish
    #[serde(default)]
    pub user_goal: String,
    /// Outstanding action items
    #[serde(default)]
    pub action_items: Vec<String>,
    /// Overall sentiment: positive, neutral, negative, or mixed
    #[serde(default = "MemorySummary::default_sentiment")]
    pub sentiment: String,
    /// Named entities mentioned in the dropped turns
    #[serde(default)]
    pub entities: Vec<String>,
    /// ISO-8601 timestamp of the summarization
    #[serde(default)]
    pub last_updated: String,
    /// Number of turns the summary covers
    #[serde(default)]
    pub turn_count: u32,
}

impl MemorySummary {
    fn default_sentiment() -> String {
        "neutral".to_owned()
    }

    /// The empty summary used when summarization fails or produces no JSON
    #[must_use]
    pub fn empty() -> Self {
        Self {
            sentiment: Self::default_sentiment(),
            ..Self::default()
        }
    }
}

/// One incoming conversation turn, assembled by the transport layer
///
/// Identity fields (`user_id`, `plan`) come from the fronting proxy; the
/// rest is client-supplied and validated by the pipeline's first stage.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Authenticated owner of the turn
    pub user_id: String,
    /// Account plan tier
    pub plan: PlanTier,
    /// Raw message content (validated and trimmed by the pipeline)
    pub content: String,
    /// Target conversation; `None` creates a new one
    pub conversation_id: Option<String>,
    /// Assistant message this turn continues from, if branching or replying
    pub parent_message_id: Option<String>,
    /// Existing branch to continue, if known
    pub branch_id: Option<String>,
    /// Side tag for creating a branch under `parent_message_id`
    pub branch_side: Option<BranchSide>,
    /// Raw provider tag from the client, validated against the catalog
    pub model_provider: Option<String>,
    /// Raw model name from the client
    pub model_name: Option<String>,
    /// Raw reasoning tier from the client, validated against the catalog
    pub reasoning_tier: Option<String>,
    /// Client-supplied idempotency key; generated when absent
    pub request_id: Option<String>,
}

/// The completed result of one turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// Conversation the turn belongs to (freshly created or pre-existing)
    pub conversation: ConversationRecord,
    /// Stored user message
    pub user_message: MessageRecord,
    /// Stored assistant reply
    pub assistant_message: MessageRecord,
    /// Model that produced the reply
    pub model: ModelSelection,
    /// True when this turn was answered from a previously stored pair
    pub idempotent_replay: bool,
    /// True when the turn created the conversation
    pub created_conversation: bool,
}
