// ABOUTME: Route module organization for the Arbor chat server HTTP endpoints
// ABOUTME: Defines shared handler state and assembles the axum router with its middleware layers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! Route module for the Arbor chat server
//!
//! Route modules contain thin handler functions that delegate to the turn
//! pipeline and the database managers. Handlers share a single [`AppState`]
//! behind an `Arc`.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::database::Database;
use crate::pipeline::TurnPipeline;
use crate::registry::TokenCallbackRegistry;

/// Conversation and turn routes
pub mod chat;

/// Chat route handlers
pub use chat::ChatRoutes;

/// Shared state for all route handlers
pub struct AppState {
    /// Database facade for the conversation read endpoints
    pub database: Database,
    /// Staged turn pipeline
    pub pipeline: TurnPipeline,
    /// Token sink registry shared with the streaming transport
    pub registry: TokenCallbackRegistry,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Assemble the application router with tracing and CORS layers applied
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(ChatRoutes::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
