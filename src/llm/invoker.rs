// ABOUTME: Model invocation engine with fallback chain, transient retry, and long-context detour
// ABOUTME: Streams tokens to an optional sink while accumulating the authoritative response text
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Model Invoker
//!
//! Drives one model invocation through an ordered candidate list: the primary
//! selection first, then the fixed fallback order from the catalog. Each
//! candidate gets one immediate retry after a transient failure (rate limit
//! or timeout). The first context-window overflow triggers a single detour to
//! the designated long-context model before the chain continues.
//!
//! When a token sink is attached the invoker streams, forwarding each delta
//! as it arrives. The accumulated text is authoritative either way; a sink
//! whose receiver has gone away never aborts the turn.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::{ChatMessage, ChatProvider, ChatRequest, LlmProvider};
use crate::catalog::{fallback_candidates, ModelSelection, Provider};
use crate::errors::AppError;

/// System prompt prepended to every conversation turn
const SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Hard cap on generated tokens per turn
const MAX_OUTPUT_TOKENS: u32 = 1000;

/// Fixed reply served when canned mode is enabled
///
/// Lets the full turn pipeline run in development without provider API keys.
const CANNED_RESPONSE: &str = "Canned response: model providers are disabled in this environment.\n\nThis fixed reply lets the turn pipeline run end to end without API keys.";

/// Sender half of a token forwarding channel
///
/// Receivers typically bridge to an SSE connection. Dropping the receiver
/// stops forwarding but never fails the invocation.
pub type TokenSink = mpsc::UnboundedSender<String>;

/// Creates provider clients on demand
///
/// The invoker resolves providers per attempt through this trait so tests
/// can substitute scripted implementations for the real API clients.
pub trait ProviderFactory: Send + Sync {
    /// Create a client for the given provider
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be constructed, typically
    /// because its API key environment variable is missing.
    fn create(&self, provider: Provider) -> Result<Box<dyn LlmProvider>, AppError>;
}

/// Factory that builds real API clients from environment variables
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProviderFactory;

impl ProviderFactory for EnvProviderFactory {
    fn create(&self, provider: Provider) -> Result<Box<dyn LlmProvider>, AppError> {
        Ok(Box::new(ChatProvider::for_provider(provider)?))
    }
}

/// Result of a successful invocation
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// Full assistant response text
    pub content: String,
    /// The selection that actually produced the response, which differs from
    /// the primary when a fallback or the long-context detour served it
    pub model: ModelSelection,
}

/// Runs model invocations with retry and fallback
pub struct ModelInvoker {
    factory: Arc<dyn ProviderFactory>,
    canned: bool,
}

impl std::fmt::Debug for ModelInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInvoker")
            .field("canned", &self.canned)
            .finish_non_exhaustive()
    }
}

impl ModelInvoker {
    /// Create an invoker backed by the given provider factory
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            canned: false,
        }
    }

    /// Enable or disable canned development responses
    #[must_use]
    pub const fn with_canned_responses(mut self, canned: bool) -> Self {
        self.canned = canned;
        self
    }

    /// Build the system message content, appending the memory summary when present
    fn system_content(summary_json: Option<&str>) -> String {
        summary_json.map_or_else(
            || SYSTEM_PROMPT.to_owned(),
            |json| format!("{SYSTEM_PROMPT}\n\nMemory summary JSON:\n{json}"),
        )
    }

    /// Invoke the primary selection, falling back through the candidate chain
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` carrying the last upstream failure message
    /// once every candidate (and the long-context detour, if taken) fails.
    #[instrument(skip(self, messages, summary_json, sink), fields(model = %primary))]
    pub async fn invoke(
        &self,
        primary: &ModelSelection,
        messages: &[ChatMessage],
        summary_json: Option<&str>,
        sink: Option<&TokenSink>,
    ) -> Result<InvocationOutcome, AppError> {
        if self.canned {
            debug!("Canned mode enabled, skipping provider invocation");
            if let Some(sink) = sink {
                let _ = sink.send(CANNED_RESPONSE.to_owned());
            }
            return Ok(InvocationOutcome {
                content: CANNED_RESPONSE.to_owned(),
                model: primary.clone(),
            });
        }

        let candidates = fallback_candidates(primary);
        let mut last_error: Option<AppError> = None;
        let mut tried_long_context = false;

        for candidate in &candidates {
            match self
                .invoke_once(candidate, messages, summary_json, sink)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(model = %candidate, error = %e.message, "Model invocation attempt failed");
                    let mut failure = e;

                    if is_transient(&failure) {
                        debug!(model = %candidate, "Transient failure, retrying once");
                        match self
                            .invoke_once(candidate, messages, summary_json, sink)
                            .await
                        {
                            Ok(outcome) => return Ok(outcome),
                            Err(retry_error) => failure = retry_error,
                        }
                    }

                    // The detour runs at most once per turn, regardless of
                    // how many candidates overflow.
                    if is_context_overflow(&failure) && !tried_long_context {
                        tried_long_context = true;
                        let detour = ModelSelection::long_context();
                        info!(model = %detour, "Context window exceeded, detouring to long-context model");
                        match self.invoke_once(&detour, messages, summary_json, sink).await {
                            Ok(outcome) => return Ok(outcome),
                            Err(detour_error) => failure = detour_error,
                        }
                    }

                    last_error = Some(failure);
                }
            }
        }

        Err(AppError::model_unavailable(last_error.map_or_else(
            || "Model invocation failed".to_owned(),
            |e| e.message,
        )))
    }

    /// One attempt against one selection
    async fn invoke_once(
        &self,
        selection: &ModelSelection,
        messages: &[ChatMessage],
        summary_json: Option<&str>,
        sink: Option<&TokenSink>,
    ) -> Result<InvocationOutcome, AppError> {
        let provider = self.factory.create(selection.provider)?;

        let mut chat_messages = Vec::with_capacity(messages.len() + 1);
        chat_messages.push(ChatMessage::system(Self::system_content(summary_json)));
        chat_messages.extend_from_slice(messages);

        let request = ChatRequest::new(chat_messages)
            .with_model(selection.name.clone())
            .with_max_tokens(MAX_OUTPUT_TOKENS)
            .with_reasoning(selection.reasoning);

        let content = if let Some(sink) = sink {
            let mut stream = provider.complete_stream(&request).await?;
            let mut accumulated = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if !chunk.delta.is_empty() {
                    accumulated.push_str(&chunk.delta);
                    // A closed sink means the client went away; the turn
                    // still completes so the assistant message persists.
                    let _ = sink.send(chunk.delta);
                }
            }
            accumulated
        } else {
            provider.complete(&request).await?.content
        };

        Ok(InvocationOutcome {
            content,
            model: selection.clone(),
        })
    }
}

/// Failures worth one immediate retry of the same candidate
fn is_transient(error: &AppError) -> bool {
    let message = error.message.to_lowercase();
    message.contains("rate limit") || message.contains("timeout") || message.contains("timed out")
}

/// Failures marking a context-window overflow
fn is_context_overflow(error: &AppError) -> bool {
    let message = error.message.to_lowercase();
    message.contains("context length")
        || message.contains("maximum context")
        || message.contains("token limit")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::llm::{ChatResponse, ChatStream, StreamChunk};

    /// Shared script of results consumed one entry per completion call
    type Script = Arc<Mutex<VecDeque<Result<String, AppError>>>>;

    struct ScriptedProvider {
        script: Script,
    }

    impl ScriptedProvider {
        fn next_result(&self) -> Result<String, AppError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::model_unavailable("script exhausted")))
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn display_name(&self) -> &'static str {
            "Scripted"
        }

        fn default_model(&self) -> &'static str {
            "scripted-1"
        }

        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AppError> {
            self.next_result().map(|content| ChatResponse {
                content,
                model: request.model.clone().unwrap_or_default(),
                usage: None,
                finish_reason: Some("stop".to_owned()),
            })
        }

        async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream, AppError> {
            let response = self.complete(request).await?;
            let mut chunks: Vec<Result<StreamChunk, AppError>> = response
                .content
                .split_inclusive(' ')
                .map(|part| {
                    Ok(StreamChunk {
                        delta: part.to_owned(),
                        is_final: false,
                        finish_reason: None,
                    })
                })
                .collect();
            chunks.push(Ok(StreamChunk {
                delta: String::new(),
                is_final: true,
                finish_reason: Some("stop".to_owned()),
            }));
            Ok(Box::pin(tokio_stream::iter(chunks)))
        }
    }

    struct ScriptedFactory {
        script: Script,
        created: Arc<Mutex<Vec<Provider>>>,
    }

    impl ScriptedFactory {
        fn new(results: Vec<Result<String, AppError>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(results.into_iter().collect())),
                created: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ProviderFactory for ScriptedFactory {
        fn create(&self, provider: Provider) -> Result<Box<dyn LlmProvider>, AppError> {
            self.created.lock().unwrap().push(provider);
            Ok(Box::new(ScriptedProvider {
                script: Arc::clone(&self.script),
            }))
        }
    }

    fn transient_error() -> AppError {
        AppError::model_unavailable("OpenAI rate limit exceeded: slow down")
    }

    fn context_error() -> AppError {
        AppError::model_unavailable("This model's maximum context length is 128000 tokens")
    }

    #[tokio::test]
    async fn test_primary_success_uses_primary_model() {
        let factory = ScriptedFactory::new(vec![Ok("hello".to_owned())]);
        let created = Arc::clone(&factory.created);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, None)
            .await
            .unwrap();

        assert_eq!(outcome.content, "hello");
        assert_eq!(outcome.model, primary);
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_same_candidate() {
        let factory =
            ScriptedFactory::new(vec![Err(transient_error()), Ok("recovered".to_owned())]);
        let created = Arc::clone(&factory.created);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, None)
            .await
            .unwrap();

        assert_eq!(outcome.content, "recovered");
        assert_eq!(outcome.model, primary);
        // Both attempts hit the same provider
        assert_eq!(
            created.lock().unwrap().as_slice(),
            &[Provider::OpenAi, Provider::OpenAi]
        );
    }

    #[tokio::test]
    async fn test_hard_failure_falls_back_to_next_candidate() {
        let factory = ScriptedFactory::new(vec![
            Err(AppError::model_unavailable("upstream exploded")),
            Ok("from fallback".to_owned()),
        ]);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, None)
            .await
            .unwrap();

        assert_eq!(outcome.content, "from fallback");
        assert_eq!(outcome.model.name, "gpt-4.1-latest");
    }

    #[tokio::test]
    async fn test_context_overflow_detours_to_long_context_model() {
        let factory =
            ScriptedFactory::new(vec![Err(context_error()), Ok("long answer".to_owned())]);
        let created = Arc::clone(&factory.created);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, None)
            .await
            .unwrap();

        assert_eq!(outcome.model, ModelSelection::long_context());
        assert_eq!(
            created.lock().unwrap().as_slice(),
            &[Provider::OpenAi, Provider::Gemini]
        );
    }

    #[tokio::test]
    async fn test_detour_runs_at_most_once() {
        // Every attempt overflows: primary, detour, then the three fallbacks.
        let factory = ScriptedFactory::new(vec![
            Err(context_error()),
            Err(context_error()),
            Err(context_error()),
            Err(context_error()),
            Err(AppError::model_unavailable("final failure")),
        ]);
        let created = Arc::clone(&factory.created);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();

        let error = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, None)
            .await
            .unwrap_err();

        assert_eq!(error.kind, ErrorKind::ModelUnavailable);
        assert_eq!(error.message, "final failure");
        // 4 candidates + exactly one detour
        assert_eq!(created.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_all_candidates_fail_returns_last_message() {
        let factory = ScriptedFactory::new(vec![
            Err(AppError::model_unavailable("first")),
            Err(AppError::model_unavailable("second")),
            Err(AppError::model_unavailable("third")),
            Err(AppError::model_unavailable("fourth")),
        ]);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();

        let error = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, None)
            .await
            .unwrap_err();

        assert_eq!(error.kind, ErrorKind::ModelUnavailable);
        assert_eq!(error.message, "fourth");
    }

    #[tokio::test]
    async fn test_sink_receives_deltas_in_order() {
        let factory = ScriptedFactory::new(vec![Ok("hello brave world".to_owned())]);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(outcome.content, "hello brave world");
        let mut deltas = Vec::new();
        while let Some(delta) = rx.recv().await {
            deltas.push(delta);
        }
        assert_eq!(deltas, vec!["hello ", "brave ", "world"]);
    }

    #[tokio::test]
    async fn test_dropped_sink_receiver_does_not_fail_turn() {
        let factory = ScriptedFactory::new(vec![Ok("still here".to_owned())]);
        let invoker = ModelInvoker::new(Arc::new(factory));
        let primary = ModelSelection::system_default();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, Some(&tx))
            .await
            .unwrap();

        assert_eq!(outcome.content, "still here");
    }

    #[tokio::test]
    async fn test_canned_mode_skips_providers() {
        let factory = ScriptedFactory::new(vec![]);
        let created = Arc::clone(&factory.created);
        let invoker = ModelInvoker::new(Arc::new(factory)).with_canned_responses(true);
        let primary = ModelSelection::system_default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = invoker
            .invoke(&primary, &[ChatMessage::user("hi")], None, Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(outcome.content, CANNED_RESPONSE);
        assert_eq!(outcome.model, primary);
        assert!(created.lock().unwrap().is_empty());
        assert_eq!(rx.recv().await.as_deref(), Some(CANNED_RESPONSE));
    }

    #[test]
    fn test_system_content_appends_summary() {
        let plain = ModelInvoker::system_content(None);
        assert_eq!(plain, SYSTEM_PROMPT);

        let with_summary = ModelInvoker::system_content(Some(r#"{"summary":"ongoing"}"#));
        assert!(with_summary.starts_with(SYSTEM_PROMPT));
        assert!(with_summary.contains("Memory summary JSON:"));
        assert!(with_summary.contains(r#"{"summary":"ongoing"}"#));
    }

    #[test]
    fn test_transient_and_context_classifiers() {
        assert!(is_transient(&transient_error()));
        assert!(is_transient(&AppError::model_unavailable(
            "request timed out after 30s"
        )));
        assert!(!is_transient(&AppError::model_unavailable("boom")));

        assert!(is_context_overflow(&context_error()));
        assert!(is_context_overflow(&AppError::model_unavailable(
            "input exceeds the model token limit"
        )));
        assert!(!is_context_overflow(&transient_error()));
    }
}
