// ABOUTME: Chat route handlers for submitting turns and managing conversations
// ABOUTME: Bridges HTTP and SSE transports to the turn pipeline and the streaming sink registry
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! Chat routes for the branching conversation API
//!
//! The turn endpoint accepts one user message and responds either with the
//! completed turn as JSON or, when `stream` is set, with an SSE stream of
//! `delta` events followed by a single `final` or `error` event. Identity
//! comes from the `x-user-id` and `x-plan` headers set by the fronting proxy.

use crate::{
    database::{BranchRecord, ConversationRecord, MessageRecord},
    errors::AppError,
    models::{BranchSide, PlanTier, TurnRequest},
    routes::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to submit one conversation turn
#[derive(Debug, Deserialize)]
pub struct CreateTurnRequest {
    /// User message content
    pub content: String,
    /// Target conversation; omitted on a first turn
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Assistant message this turn replies to
    #[serde(default)]
    pub parent_message_id: Option<String>,
    /// Existing branch to continue
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Side tag when forking a new branch under `parent_message_id`
    #[serde(default)]
    pub branch_side: Option<BranchSide>,
    /// Requested model provider
    #[serde(default)]
    pub model_provider: Option<String>,
    /// Requested model name
    #[serde(default)]
    pub model_name: Option<String>,
    /// Requested reasoning tier
    #[serde(default)]
    pub reasoning_tier: Option<String>,
    /// Idempotency key for retries
    #[serde(default)]
    pub request_id: Option<String>,
    /// Stream the reply over SSE instead of returning JSON
    #[serde(default)]
    pub stream: bool,
}

/// Response for listing conversations
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    /// Non-archived conversations, most recently updated first
    pub conversations: Vec<ConversationRecord>,
    /// Total count
    pub total: usize,
}

/// Response for fetching one conversation with its full tree
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationDetailResponse {
    /// The conversation row
    pub conversation: ConversationRecord,
    /// Every message in creation order, across all branches
    pub messages: Vec<MessageRecord>,
    /// Every branch in creation order
    pub branches: Vec<BranchRecord>,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Chat conversation route handlers
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create chat routes with shared state
    pub fn routes(state: Arc<AppState>) -> Router {
        Router::new()
            // Turn submission (JSON or SSE reply)
            .route("/api/turns", post(Self::create_turn))
            // Conversation management
            .route("/api/conversations", get(Self::list_conversations))
            .route(
                "/api/conversations/:conversation_id",
                get(Self::get_conversation),
            )
            .route(
                "/api/conversations/:conversation_id",
                delete(Self::archive_conversation),
            )
            .with_state(state)
    }

    /// Read the proxy-supplied identity headers
    ///
    /// The fronting proxy authenticates callers and forwards `x-user-id` and
    /// `x-plan`. A request without a user id never reaches the pipeline.
    fn identify(headers: &axum::http::HeaderMap) -> Result<(String, PlanTier), AppError> {
        let user_id = headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::invalid_input("Missing x-user-id header"))?
            .to_owned();

        let plan = headers
            .get("x-plan")
            .and_then(|value| value.to_str().ok())
            .map_or_else(PlanTier::default, PlanTier::from_str_or_default);

        Ok((user_id, plan))
    }

    /// Submit one turn, replying with JSON or an SSE stream
    async fn create_turn(
        State(state): State<Arc<AppState>>,
        headers: axum::http::HeaderMap,
        Json(body): Json<CreateTurnRequest>,
    ) -> Result<Response, AppError> {
        let (user_id, plan) = Self::identify(&headers)?;

        let request = TurnRequest {
            user_id,
            plan,
            content: body.content,
            conversation_id: body.conversation_id,
            parent_message_id: body.parent_message_id,
            branch_id: body.branch_id,
            branch_side: body.branch_side,
            model_provider: body.model_provider,
            model_name: body.model_name,
            reasoning_tier: body.reasoning_tier,
            request_id: body.request_id,
        };

        if body.stream {
            return Ok(Self::stream_turn(&state, request).into_response());
        }

        let outcome = state.pipeline.run(request).await?;
        Ok((StatusCode::OK, Json(outcome)).into_response())
    }

    /// Run the turn on a background task and stream its tokens as SSE events
    ///
    /// The sink is registered under the resolved request id before the
    /// pipeline starts, so the invoker finds it when the model stage begins.
    /// The registration guard travels into the task: whichever way the run
    /// ends, the registry entry is released and the channel closes. A caller
    /// that disconnects mid-stream stops receiving tokens while the turn
    /// still runs to completion and persists.
    fn stream_turn(
        state: &Arc<AppState>,
        mut request: TurnRequest,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let request_id = request
            .request_id
            .take()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request.request_id = Some(request_id.clone());

        let (sink, mut tokens) = mpsc::unbounded_channel();
        let guard = state.registry.register(&request_id, sink);

        let pipeline_state = Arc::clone(state);
        let turn = tokio::spawn(async move {
            let result = pipeline_state.pipeline.run(request).await;
            drop(guard);
            result
        });

        let stream = async_stream::stream! {
            while let Some(text) = tokens.recv().await {
                let event = serde_json::json!({"type": "delta", "text": text});
                yield Ok(Event::default().data(event.to_string()));
            }

            // A closed channel means the run finished; collect its result
            let event = match turn.await {
                Ok(Ok(outcome)) => serde_json::json!({
                    "type": "final",
                    "payload": outcome,
                }),
                Ok(Err(app_error)) => {
                    let status = app_error.http_status();
                    serde_json::json!({
                        "type": "error",
                        "error": app_error.message,
                        "status": status,
                    })
                }
                Err(join_error) => {
                    error!("Turn task failed: {join_error}");
                    serde_json::json!({
                        "type": "error",
                        "error": "Turn task failed",
                        "status": 500,
                    })
                }
            };
            yield Ok(Event::default().data(event.to_string()));
        };

        Sse::new(stream).keep_alive(KeepAlive::default())
    }

    /// List the caller's conversations
    async fn list_conversations(
        State(state): State<Arc<AppState>>,
        headers: axum::http::HeaderMap,
    ) -> Result<Response, AppError> {
        let (user_id, _plan) = Self::identify(&headers)?;

        let conversations = state.database.conversations().list(&user_id).await?;
        let response = ConversationListResponse {
            total: conversations.len(),
            conversations,
        };

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    /// Fetch one conversation with its messages and branches
    async fn get_conversation(
        State(state): State<Arc<AppState>>,
        headers: axum::http::HeaderMap,
        Path(conversation_id): Path<String>,
    ) -> Result<Response, AppError> {
        let (user_id, _plan) = Self::identify(&headers)?;

        let conversation = state
            .database
            .conversations()
            .get(&conversation_id, &user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        let messages = state
            .database
            .messages()
            .list_for_conversation(&conversation_id)
            .await?;
        let branches = state.database.branches().list(&conversation_id).await?;

        let response = ConversationDetailResponse {
            conversation,
            messages,
            branches,
        };

        Ok((StatusCode::OK, Json(response)).into_response())
    }

    /// Archive a conversation so it no longer appears in listings
    async fn archive_conversation(
        State(state): State<Arc<AppState>>,
        headers: axum::http::HeaderMap,
        Path(conversation_id): Path<String>,
    ) -> Result<Response, AppError> {
        let (user_id, _plan) = Self::identify(&headers)?;

        let archived = state
            .database
            .conversations()
            .archive(&conversation_id, &user_id)
            .await?;
        if !archived {
            return Err(AppError::not_found("Conversation"));
        }

        Ok((StatusCode::NO_CONTENT, ()).into_response())
    }
}
