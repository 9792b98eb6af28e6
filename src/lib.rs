// ABOUTME: Main library entry point for the Arbor branching chat server
// ABOUTME: Exposes the turn pipeline, transports, and supporting modules as a library crate
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

#![deny(unsafe_code)]

//! # Arbor Server
//!
//! An HTTP service that orchestrates conversation turns for a branching chat
//! application. Each turn runs through a staged pipeline: validation, daily
//! quota, history assembly with rolling summaries, safety screening, model
//! invocation with retry and fallback, output screening, and a single
//! idempotent persistence step. Replies stream over SSE or return as JSON.
//!
//! ## Architecture
//!
//! - **Pipeline**: The staged turn orchestrator and its outcome types
//! - **Catalog**: Selectable models, reasoning tiers, and fallback order
//! - **History**: Parent-chain assembly, summarization, and token budgeting
//! - **LLM**: Provider adapters (OpenAI, Anthropic, Gemini) and the invoker
//! - **Moderation**: Fast lexical gate plus remote content scoring
//! - **Database**: SQLite-backed conversations, messages, branches, usage
//! - **Routes**: axum handlers for turns, listings, and SSE streaming
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use arbor_server::config::ServerConfig;
//! use arbor_server::errors::AppResult;
//!
//! fn main() -> AppResult<()> {
//!     // Load configuration
//!     let config = ServerConfig::from_env()?;
//!
//!     println!("Arbor server configured with port: HTTP={}", config.http_port);
//!
//!     Ok(())
//! }
//! ```

/// Model catalog with selectable models and the fallback order
pub mod catalog;

/// Environment-driven server configuration
pub mod config;

/// SQLite database bootstrap and per-domain operation managers
pub mod database;

/// Unified error handling with standard error kinds and HTTP responses
pub mod errors;

/// Conversation history assembly and token budgeting
pub mod history;

/// LLM provider abstraction, adapters, and the retrying invoker
pub mod llm;

/// Production logging and structured output
pub mod logging;

/// Shared domain types exchanged between transport and pipeline
pub mod models;

/// Content safety screening (fast gate and remote moderation)
pub mod moderation;

/// The staged turn pipeline
pub mod pipeline;

/// Daily message quota enforcement
pub mod quota;

/// Token sink registry bridging the SSE transport and the invoker
pub mod registry;

/// HTTP routes for turns and conversation management
pub mod routes;

/// Rolling memory summary generation
pub mod summarizer;

/// Background conversation title generation
pub mod title;
