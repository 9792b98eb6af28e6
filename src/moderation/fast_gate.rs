// ABOUTME: Local regex-based moderation gate run before any remote moderation call
// ABOUTME: Blocks hard-rule matches, risky category phrases, and link spam without network I/O
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Fast Gate
//!
//! A local pre-filter that rejects clearly unacceptable content before the
//! remote moderation API is consulted. Three rule groups run in order:
//!
//! 1. **Hard rules**: phrases blocked outright. Replaceable at startup via a
//!    JSON array of regex patterns in configuration.
//! 2. **Category rules**: fixed phrase lists for self-harm and illicit topics.
//! 3. **Spam heuristic**: two or more URLs combined with a scam keyword.
//!
//! Patterns match substrings, which errs toward over-blocking; the remote
//! moderation pass never sees content the gate rejects.

use regex::Regex;
use tracing::warn;

use crate::errors::AppError;

/// Built-in hard rules, used when no override is configured
const DEFAULT_HARD_RULES: &[&str] = &[
    "(?i)(kill yourself|suicide|self harm|bomb making|how to make explosives)",
    "(?i)(cp|child porn|underage|lolita)",
    "(?i)(nigger|faggot|kike|chink)",
    "(?i)(porn|xxx|nude|onlyfans|sex chat)",
];

/// Fixed category rules for self-harm and illicit-behavior phrasing
const CATEGORY_RULES: &[&str] = &[
    "(?i)(suicide|cut myself|overdose|die)",
    "(?i)(hack|phish|carding|drugs|meth|cocaine|darkweb)",
];

/// Keywords that mark multi-link messages as spam
const SPAM_KEYWORDS: &[&str] = &["free money", "crypto scam", "investment return"];

/// Matches one URL occurrence
const URL_PATTERN: &str = r"https?://\S+";

/// Minimum URL count for the spam heuristic
const SPAM_URL_THRESHOLD: usize = 2;

/// Block reason for hard rule matches
pub const REASON_HARD: &str = "fast_gate_hard";

/// Block reason for category rule matches
pub const REASON_CATEGORY: &str = "fast_gate_category";

/// Block reason for the spam heuristic
pub const REASON_SPAM: &str = "fast_gate_spam";

/// Local moderation gate with compiled rules
#[derive(Debug)]
pub struct FastGate {
    hard_rules: Vec<Regex>,
    category_rules: Vec<Regex>,
    url_pattern: Regex,
}

impl FastGate {
    /// Create a gate with the built-in rule set
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a built-in pattern fails to compile.
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            hard_rules: compile_rules(DEFAULT_HARD_RULES)?,
            category_rules: compile_rules(CATEGORY_RULES)?,
            url_pattern: compile_pattern(URL_PATTERN)?,
        })
    }

    /// Create a gate from an optional JSON override of the hard rules
    ///
    /// The override must be a JSON array of regex strings. Malformed JSON,
    /// an empty array, or any invalid pattern discards the whole override
    /// and keeps the built-in rules. Category and spam rules are fixed.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a built-in pattern fails to compile.
    pub fn from_rules_json(rules_json: Option<&str>) -> Result<Self, AppError> {
        let defaults = Self::new()?;

        let Some(json) = rules_json else {
            return Ok(defaults);
        };

        let patterns: Vec<String> = match serde_json::from_str(json) {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!(error = %e, "Invalid hard rule override JSON, keeping built-in rules");
                return Ok(defaults);
            }
        };

        if patterns.is_empty() {
            return Ok(defaults);
        }

        let refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
        match compile_rules(&refs) {
            Ok(hard_rules) => Ok(Self {
                hard_rules,
                ..defaults
            }),
            Err(e) => {
                warn!(error = %e.message, "Invalid hard rule override pattern, keeping built-in rules");
                Ok(defaults)
            }
        }
    }

    /// Check content against all rule groups, in order
    ///
    /// Returns the block reason, or `None` when the content passes.
    #[must_use]
    pub fn check(&self, content: &str) -> Option<&'static str> {
        if self.hard_rules.iter().any(|rule| rule.is_match(content)) {
            return Some(REASON_HARD);
        }

        if self.category_rules.iter().any(|rule| rule.is_match(content)) {
            return Some(REASON_CATEGORY);
        }

        if self.is_spam(content) {
            return Some(REASON_SPAM);
        }

        None
    }

    /// Two or more links plus a scam keyword marks a message as spam
    fn is_spam(&self, content: &str) -> bool {
        let url_count = self.url_pattern.find_iter(content).count();
        if url_count < SPAM_URL_THRESHOLD {
            return false;
        }

        let lowered = content.to_lowercase();
        SPAM_KEYWORDS
            .iter()
            .any(|keyword| lowered.contains(keyword))
    }
}

/// Compile a list of patterns, failing on the first invalid one
fn compile_rules(patterns: &[&str]) -> Result<Vec<Regex>, AppError> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

fn compile_pattern(pattern: &str) -> Result<Regex, AppError> {
    Regex::new(pattern)
        .map_err(|e| AppError::config(format!("Invalid moderation rule '{pattern}': {e}")))
}
