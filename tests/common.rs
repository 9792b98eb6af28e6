// ABOUTME: Shared helpers for integration tests across the turn pipeline and HTTP surface
// ABOUTME: Provides scripted providers, moderation stubs, and database/pipeline/router assembly
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::similar_names
)]
#![allow(missing_docs)]

//! Shared test utilities for `arbor_server`
//!
//! Every integration test file drives the pipeline through scripted provider
//! replies and stubbed moderation scores, so the setup lives here once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use uuid::Uuid;

use arbor_server::catalog::Provider;
use arbor_server::config::ServerConfig;
use arbor_server::database::Database;
use arbor_server::errors::AppError;
use arbor_server::llm::{
    ChatRequest, ChatResponse, ChatStream, LlmProvider, ProviderFactory, StreamChunk,
};
use arbor_server::models::{PlanTier, TurnRequest};
use arbor_server::moderation::{ModerationProvider, ModerationScores};
use arbor_server::pipeline::TurnPipeline;
use arbor_server::registry::TokenCallbackRegistry;
use arbor_server::routes::{self, AppState};

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        // TEST_LOG controls verbosity; default WARN keeps test output quiet
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// A uniquely named shared in-memory database URL
///
/// Detached tasks (title generation, streamed turns) touch the database from
/// a second pooled connection, so tests need every connection in one pool to
/// see the same data. A named `mode=memory&cache=shared` database gives that
/// while keeping each test isolated from the others.
pub fn memory_database_url() -> String {
    format!(
        "sqlite:file:testdb-{}?mode=memory&cache=shared",
        Uuid::new_v4().simple()
    )
}

/// Standard test database setup
pub async fn create_test_database() -> Result<Database> {
    init_test_logging();
    Database::new(&memory_database_url()).await
}

// ============================================================================
// Scripted Provider
// ============================================================================

/// Model the title generator and summarizer use for their side calls
const SIDE_MODEL: &str = "gpt-4o-mini";

/// Fixed reply served to side calls so they never consume the turn script
pub const SIDE_CALL_REPLY: &str = "Scripted title";

type ReplyScript = Arc<Mutex<VecDeque<Result<String, AppError>>>>;

/// Provider whose turn completions come from a shared reply script
///
/// Title and summary side calls are answered with [`SIDE_CALL_REPLY`] and
/// are not recorded, which keeps the script and the call log deterministic
/// even though those calls run on detached tasks.
pub struct StubProvider {
    script: ReplyScript,
    models_called: Arc<Mutex<Vec<String>>>,
}

impl StubProvider {
    fn next_reply(&self, request: &ChatRequest) -> Result<String, AppError> {
        let model = request.model.clone().unwrap_or_default();
        if model == SIDE_MODEL {
            return Ok(SIDE_CALL_REPLY.to_owned());
        }

        self.models_called.lock().unwrap().push(model);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::model_unavailable("reply script exhausted")))
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn display_name(&self) -> &'static str {
        "Stub"
    }

    fn default_model(&self) -> &'static str {
        "stub-1"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
        self.next_reply(request).map(|content| ChatResponse {
            content,
            model: request.model.clone().unwrap_or_default(),
            usage: None,
            finish_reason: Some("stop".to_owned()),
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
        let response = self.complete(request).await?;

        // One chunk per word, then the final marker, mirroring how the real
        // providers deliver token deltas
        let mut chunks: Vec<Result<StreamChunk, AppError>> = Vec::new();
        for part in response.content.split_inclusive(' ') {
            chunks.push(Ok(StreamChunk {
                delta: part.to_owned(),
                is_final: false,
                finish_reason: None,
            }));
        }
        chunks.push(Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            finish_reason: response.finish_reason,
        }));

        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

/// Factory handing out [`StubProvider`] clients for every provider
pub struct StubFactory {
    script: ReplyScript,
    /// Model names requested by turn completions, in call order
    pub models_called: Arc<Mutex<Vec<String>>>,
}

impl StubFactory {
    pub fn with_replies(replies: Vec<Result<String, AppError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(replies.into_iter().collect())),
            models_called: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProviderFactory for StubFactory {
    fn create(&self, _provider: Provider) -> Result<Box<dyn LlmProvider>, AppError> {
        Ok(Box::new(StubProvider {
            script: Arc::clone(&self.script),
            models_called: Arc::clone(&self.models_called),
        }))
    }
}

// ============================================================================
// Moderation Stubs
// ============================================================================

/// Moderation provider serving a scripted sequence of score sets
///
/// An exhausted script falls back to clean scores, so a single scripted set
/// can target either the input or the output pass.
pub struct StubModeration {
    scripted: Mutex<VecDeque<ModerationScores>>,
}

impl StubModeration {
    pub fn clean() -> Self {
        Self::with_scores(Vec::new())
    }

    pub fn with_scores(scores: Vec<ModerationScores>) -> Self {
        Self {
            scripted: Mutex::new(scores.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ModerationProvider for StubModeration {
    async fn score(&self, _input: &str) -> Result<ModerationScores, AppError> {
        Ok(self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

/// Scores the moderation API would return for outright-flagged content
pub fn flagged_scores(category: &str) -> ModerationScores {
    ModerationScores {
        flagged: true,
        flagged_categories: vec![category.to_owned()],
        category_scores: HashMap::new(),
    }
}

// ============================================================================
// Pipeline Assembly
// ============================================================================

/// Everything a pipeline test needs to drive and inspect one turn pipeline
pub struct PipelineHarness {
    pub database: Database,
    pub pipeline: TurnPipeline,
    pub registry: TokenCallbackRegistry,
    /// Model names requested by turn completions, in call order
    pub models_called: Arc<Mutex<Vec<String>>>,
}

/// Config for tests that run without the remote moderation service
///
/// The local fast gate still applies.
pub fn offline_config() -> ServerConfig {
    ServerConfig {
        moderation_disabled: true,
        ..ServerConfig::default()
    }
}

/// Build a pipeline with scripted provider replies and clean moderation
pub async fn create_pipeline(
    config: ServerConfig,
    replies: Vec<Result<String, AppError>>,
) -> Result<PipelineHarness> {
    create_pipeline_with_moderation(config, replies, Arc::new(StubModeration::clean())).await
}

/// Build a pipeline with scripted provider replies and a custom moderation stub
pub async fn create_pipeline_with_moderation(
    config: ServerConfig,
    replies: Vec<Result<String, AppError>>,
    moderation: Arc<dyn ModerationProvider>,
) -> Result<PipelineHarness> {
    let database = create_test_database().await?;
    let factory = StubFactory::with_replies(replies);
    let models_called = Arc::clone(&factory.models_called);
    let registry = TokenCallbackRegistry::new();
    let pipeline = TurnPipeline::new(
        database.clone(),
        &config,
        Arc::new(factory),
        moderation,
        registry.clone(),
    )?;

    Ok(PipelineHarness {
        database,
        pipeline,
        registry,
        models_called,
    })
}

/// A minimal turn request; tests override the fields they exercise
pub fn turn_request(user_id: &str, content: &str) -> TurnRequest {
    TurnRequest {
        user_id: user_id.to_owned(),
        plan: PlanTier::Free,
        content: content.to_owned(),
        conversation_id: None,
        parent_message_id: None,
        branch_id: None,
        branch_side: None,
        model_provider: None,
        model_name: None,
        reasoning_tier: None,
        request_id: None,
    }
}

// ============================================================================
// HTTP Surface Assembly
// ============================================================================

/// A routed application plus the database behind it
pub struct AppHarness {
    pub app: Router,
    pub database: Database,
}

/// Build the full router over a scripted pipeline
pub async fn create_app(
    config: ServerConfig,
    replies: Vec<Result<String, AppError>>,
) -> Result<AppHarness> {
    let harness = create_pipeline(config, replies).await?;
    let database = harness.database.clone();
    let state = Arc::new(AppState {
        database: harness.database,
        pipeline: harness.pipeline,
        registry: harness.registry,
    });

    Ok(AppHarness {
        app: routes::router(state),
        database,
    })
}

/// Build a JSON API request
pub fn api_request(
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Read a response body to completion as text
pub async fn response_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Read a response body to completion and parse it as JSON
pub async fn response_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Decode the `data:` payloads of a finished SSE body, in order
///
/// Comment lines (keep-alives) and blank separators are skipped.
pub fn parse_sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}
