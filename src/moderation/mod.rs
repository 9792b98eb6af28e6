// ABOUTME: Content safety filtering combining a local fast gate with remote moderation scores
// ABOUTME: Applies the category threshold policy that decides whether content is blocked
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Content Moderation
//!
//! Safety checks run twice per turn: on the user's input before any model
//! call, and on the assistant's output before persistence. Both passes share
//! [`SafetyFilter::check`], which consults the local [`FastGate`] first and
//! only sends content that passes to the remote moderation API.
//!
//! Remote scores feed a two-tier threshold policy: a small set of critical
//! categories blocks at a much lower score than everything else.

mod client;
mod fast_gate;

use std::sync::Arc;

use tracing::{debug, instrument};

pub use client::{ModerationClient, ModerationProvider, ModerationScores};
pub use fast_gate::{FastGate, REASON_CATEGORY, REASON_HARD, REASON_SPAM};

use crate::errors::AppError;

/// Categories blocked at the lower critical threshold
const CRITICAL_CATEGORIES: &[&str] = &[
    "sexual/minors",
    "self-harm/intent",
    "self-harm/instructions",
    "violence/graphic",
    "illicit/violent",
];

/// Score at or above which a critical category blocks
const CRITICAL_THRESHOLD: f64 = 0.2;

/// Score at or above which any other category blocks
const DEFAULT_THRESHOLD: f64 = 0.5;

/// Block reason when the API flags content outright
const REASON_FLAGGED: &str = "flagged";

/// Block reason when a critical category crosses its threshold
const REASON_CRITICAL: &str = "critical_threshold";

/// Block reason when a non-critical category crosses the default threshold
const REASON_DEFAULT: &str = "default_threshold";

/// Outcome of one safety check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    /// Whether the content is blocked
    pub blocked: bool,
    /// Why it was blocked, when it was
    pub reason: Option<String>,
    /// Offending categories, when the remote pass identified any
    pub categories: Vec<String>,
}

impl SafetyVerdict {
    /// Content passed all checks
    #[must_use]
    pub const fn allowed() -> Self {
        Self {
            blocked: false,
            reason: None,
            categories: Vec::new(),
        }
    }

    /// Content was blocked for the given reason
    #[must_use]
    pub fn blocked(reason: &str, categories: Vec<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.to_owned()),
            categories,
        }
    }
}

/// Apply the threshold policy to remote moderation scores
#[must_use]
pub fn evaluate_scores(scores: &ModerationScores) -> SafetyVerdict {
    if scores.flagged {
        return SafetyVerdict::blocked(REASON_FLAGGED, scores.flagged_categories.clone());
    }

    let critical: Vec<String> = CRITICAL_CATEGORIES
        .iter()
        .filter(|category| {
            scores
                .category_scores
                .get(**category)
                .is_some_and(|score| *score >= CRITICAL_THRESHOLD)
        })
        .map(|category| (*category).to_owned())
        .collect();
    if !critical.is_empty() {
        return SafetyVerdict::blocked(REASON_CRITICAL, critical);
    }

    let mut over_default: Vec<String> = scores
        .category_scores
        .iter()
        .filter(|(category, score)| {
            !CRITICAL_CATEGORIES.contains(&category.as_str()) && **score >= DEFAULT_THRESHOLD
        })
        .map(|(category, _)| category.clone())
        .collect();
    if !over_default.is_empty() {
        over_default.sort();
        return SafetyVerdict::blocked(REASON_DEFAULT, over_default);
    }

    SafetyVerdict::allowed()
}

/// Two-stage safety filter: local fast gate, then remote scoring
pub struct SafetyFilter {
    fast_gate: FastGate,
    provider: Arc<dyn ModerationProvider>,
    remote_disabled: bool,
}

impl std::fmt::Debug for SafetyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyFilter")
            .field("fast_gate", &self.fast_gate)
            .field("remote_disabled", &self.remote_disabled)
            .finish_non_exhaustive()
    }
}

impl SafetyFilter {
    /// Create a filter with the built-in fast gate rules
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the built-in rules fail to compile.
    pub fn new(provider: Arc<dyn ModerationProvider>) -> Result<Self, AppError> {
        Ok(Self {
            fast_gate: FastGate::new()?,
            provider,
            remote_disabled: false,
        })
    }

    /// Replace the fast gate, typically with one built from configured rules
    #[must_use]
    pub fn with_fast_gate(mut self, fast_gate: FastGate) -> Self {
        self.fast_gate = fast_gate;
        self
    }

    /// Disable the remote scoring pass; the fast gate still runs
    #[must_use]
    pub const fn with_remote_disabled(mut self, disabled: bool) -> Self {
        self.remote_disabled = disabled;
        self
    }

    /// Check one piece of content
    ///
    /// Content the fast gate rejects never reaches the remote API.
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` when the remote moderation call fails.
    #[instrument(skip(self, content), fields(chars = content.len()))]
    pub async fn check(&self, content: &str) -> Result<SafetyVerdict, AppError> {
        if let Some(reason) = self.fast_gate.check(content) {
            debug!(reason = reason, "Fast gate blocked content");
            return Ok(SafetyVerdict::blocked(reason, Vec::new()));
        }

        if self.remote_disabled {
            return Ok(SafetyVerdict::allowed());
        }

        let scores = self.provider.score(content).await?;
        let verdict = evaluate_scores(&scores);
        if verdict.blocked {
            debug!(
                reason = verdict.reason.as_deref().unwrap_or(""),
                categories = ?verdict.categories,
                "Remote moderation blocked content"
            );
        }

        Ok(verdict)
    }
}
