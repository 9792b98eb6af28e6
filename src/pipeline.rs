// ABOUTME: The conversation turn pipeline from raw request to persisted assistant reply
// ABOUTME: Orchestrates validation, quota, history, safety, invocation, idempotent persistence, and titling
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Turn Pipeline
//!
//! One call to [`TurnPipeline::run`] converts an incoming user message into a
//! persisted, safety-checked assistant reply. Stages run sequentially:
//! validation, idempotent replay lookup, quota, history assembly, input
//! safety, model invocation, output safety, persistence, and finally a
//! detached title task for brand-new conversations.
//!
//! The pipeline owns no transport concerns. Streaming callers register a
//! token sink in the [`TokenCallbackRegistry`] under the turn's request id
//! before calling [`TurnPipeline::run`]; the model stage claims the sink if
//! one is present and otherwise just accumulates the reply.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::{self, ModelSelection, Provider, ReasoningTier};
use crate::config::ServerConfig;
use crate::database::{ConversationRecord, Database, MessageRecord, NewMessage};
use crate::errors::AppError;
use crate::history::{trim_to_token_budget, HistoryBuilder, TOKEN_BUDGET};
use crate::llm::{ChatMessage, MessageRole, ModelInvoker, ProviderFactory};
use crate::models::{PlanTier, TurnOutcome, TurnRequest};
use crate::moderation::{FastGate, ModerationProvider, SafetyFilter};
use crate::quota::UsageGate;
use crate::registry::TokenCallbackRegistry;
use crate::summarizer::Summarizer;
use crate::title::{fallback_title, TitleGenerator};

/// A turn that passed validation, with every reference resolved
struct ValidatedTurn {
    user_id: String,
    plan: PlanTier,
    content: String,
    conversation: ConversationRecord,
    created_conversation: bool,
    parent_message_id: Option<String>,
    branch_id: Option<String>,
    model: ModelSelection,
    request_id: String,
}

/// Orchestrates one conversation turn end to end
pub struct TurnPipeline {
    database: Database,
    usage_gate: UsageGate,
    history: HistoryBuilder,
    safety: SafetyFilter,
    invoker: ModelInvoker,
    titles: TitleGenerator,
    registry: TokenCallbackRegistry,
}

impl std::fmt::Debug for TurnPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPipeline").finish_non_exhaustive()
    }
}

impl TurnPipeline {
    /// Assemble the pipeline from its collaborators
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the fast gate rules fail to compile.
    pub fn new(
        database: Database,
        config: &ServerConfig,
        factory: Arc<dyn ProviderFactory>,
        moderation: Arc<dyn ModerationProvider>,
        registry: TokenCallbackRegistry,
    ) -> Result<Self, AppError> {
        let safety = SafetyFilter::new(moderation)?
            .with_fast_gate(FastGate::from_rules_json(config.fast_gate_rules.as_deref())?)
            .with_remote_disabled(config.moderation_disabled);
        let summarizer = Summarizer::new(Arc::clone(&factory));
        let history = HistoryBuilder::new(database.messages(), summarizer);
        let usage_gate = UsageGate::new(
            database.usage(),
            config.quota_timezone,
            config.daily_limit_disabled,
        );
        let invoker =
            ModelInvoker::new(Arc::clone(&factory)).with_canned_responses(config.canned_responses);
        let titles = TitleGenerator::new(factory, database.conversations());

        Ok(Self {
            database,
            usage_gate,
            history,
            safety,
            invoker,
            titles,
            registry,
        })
    }

    /// Run one conversation turn
    ///
    /// # Errors
    ///
    /// Returns the first stage failure: `InvalidInput`/`NotFound` from
    /// validation, `QuotaExceeded` from the usage gate, `UnsafeContent` from
    /// either moderation pass, `ModelUnavailable` when every provider
    /// candidate fails, `IdempotentResponseMissing` for a replayed request
    /// id with no stored reply, or `Internal` for persistence failures.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn run(&self, request: TurnRequest) -> Result<TurnOutcome, AppError> {
        let turn = self.validate(request).await?;

        // Duplicate submissions answer from the stored pair before any
        // quota or model spend
        if let Some(outcome) = self.find_replay(&turn).await? {
            info!(request_id = %turn.request_id, "Turn answered from stored pair");
            return Ok(outcome);
        }

        self.usage_gate.check(&turn.user_id, turn.plan).await?;

        let history = self
            .history
            .build(&turn.conversation.id, turn.parent_message_id.as_deref())
            .await?;

        let input_verdict = self.safety.check(&turn.content).await?;
        if input_verdict.blocked {
            warn!(
                reason = input_verdict.reason.as_deref().unwrap_or(""),
                "Blocked unsafe user input"
            );
            return Err(AppError::unsafe_content("Unsafe input detected"));
        }

        let summary_json = history
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::internal(format!("Failed to serialize memory summary: {e}")))?;

        let mut messages = trim_to_token_budget(
            history.messages,
            &turn.content,
            summary_json.as_deref(),
            TOKEN_BUDGET,
        );
        messages.push(ChatMessage::user(turn.content.as_str()));

        let sink = self.registry.take(&turn.request_id);
        let invocation = self
            .invoker
            .invoke(&turn.model, &messages, summary_json.as_deref(), sink.as_ref())
            .await?;

        if invocation.content.is_empty() {
            return Err(AppError::internal("Assistant response missing"));
        }
        let output_verdict = self.safety.check(&invocation.content).await?;
        if output_verdict.blocked {
            warn!(
                reason = output_verdict.reason.as_deref().unwrap_or(""),
                model = %invocation.model,
                "Blocked unsafe assistant output"
            );
            return Err(AppError::unsafe_content("Unsafe output detected"));
        }

        let outcome = self
            .persist(&turn, &invocation.content, &invocation.model)
            .await?;

        if outcome.created_conversation && !outcome.idempotent_replay {
            self.spawn_title_task(&outcome.conversation.id, &turn.content);
        }

        info!(
            conversation_id = %outcome.conversation.id,
            model = %outcome.model,
            "Turn completed"
        );
        Ok(outcome)
    }

    /// Validate the raw request and resolve every reference it carries
    ///
    /// Creates the conversation (and branch, when forking) eagerly so later
    /// stages work against persisted rows.
    async fn validate(&self, request: TurnRequest) -> Result<ValidatedTurn, AppError> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(AppError::invalid_input("Content is required"));
        }
        let content = content.to_owned();

        let conversations = self.database.conversations();
        let (conversation, created_conversation) = match &request.conversation_id {
            Some(id) => {
                let conversation = conversations
                    .get(id, &request.user_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("Conversation"))?;
                (conversation, false)
            }
            None => {
                let conversation = conversations
                    .create(&request.user_id, &fallback_title(&content))
                    .await?;
                debug!(conversation_id = %conversation.id, "Created conversation for first turn");
                (conversation, true)
            }
        };

        let branch_id = self.resolve_branch(&request, &conversation).await?;
        let model = self.resolve_model(&request, &conversation.id).await?;

        let request_id = request
            .request_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(ValidatedTurn {
            user_id: request.user_id,
            plan: request.plan,
            content,
            conversation,
            created_conversation,
            parent_message_id: request.parent_message_id,
            branch_id,
            model,
            request_id,
        })
    }

    /// Resolve which branch the turn continues, creating one when forking
    ///
    /// A supplied branch id must belong to the conversation and match the
    /// supplied parent. A parent/side pair without a branch id reuses the
    /// open branch at that fork, rejects a committed one, and otherwise
    /// creates a fresh branch row.
    async fn resolve_branch(
        &self,
        request: &TurnRequest,
        conversation: &ConversationRecord,
    ) -> Result<Option<String>, AppError> {
        let branches = self.database.branches();

        if let Some(branch_id) = &request.branch_id {
            let branch = branches
                .get(branch_id)
                .await?
                .filter(|b| b.conversation_id == conversation.id)
                .ok_or_else(|| AppError::not_found("Branch"))?;
            if let Some(parent_id) = &request.parent_message_id {
                if branch.parent_message_id != *parent_id {
                    return Err(AppError::invalid_input("Branch parent mismatch"));
                }
            }
            return Ok(Some(branch.id));
        }

        if let (Some(parent_id), Some(side)) = (&request.parent_message_id, request.branch_side) {
            if let Some(existing) = branches
                .find_fork(&conversation.id, parent_id, side)
                .await?
            {
                if self
                    .database
                    .messages()
                    .branch_has_messages(&existing.id)
                    .await?
                {
                    return Err(AppError::invalid_input(
                        "Branch at this fork already has messages",
                    ));
                }
                debug!(branch_id = %existing.id, "Reusing open branch at fork");
                return Ok(Some(existing.id));
            }

            let branch = branches.create(&conversation.id, parent_id, side).await?;
            debug!(branch_id = %branch.id, side = %side, "Created branch");
            return Ok(Some(branch.id));
        }

        Ok(None)
    }

    /// Resolve the model for the turn
    ///
    /// An explicitly requested pair must be in the selectable catalog. With
    /// no valid request the conversation sticks to whatever its most recent
    /// message recorded, and a fresh conversation gets the system default.
    async fn resolve_model(
        &self,
        request: &TurnRequest,
        conversation_id: &str,
    ) -> Result<ModelSelection, AppError> {
        if let (Some(provider_tag), Some(name)) = (&request.model_provider, &request.model_name) {
            if let Some(provider) = Provider::parse(provider_tag) {
                if catalog::is_selectable(provider, name) {
                    let mut selection = ModelSelection::new(provider, name.clone());
                    selection.reasoning = request
                        .reasoning_tier
                        .as_deref()
                        .and_then(ReasoningTier::parse);
                    return Ok(selection);
                }
            }
            debug!(
                provider = %provider_tag,
                model = %name,
                "Requested model not selectable, resolving from history"
            );
        }

        if let Some(latest) = self.database.messages().latest(conversation_id).await? {
            if let Some(selection) = selection_from_message(&latest) {
                return Ok(selection);
            }
        }

        Ok(ModelSelection::system_default())
    }

    /// Answer a duplicate submission from its stored pair, if one exists
    async fn find_replay(&self, turn: &ValidatedTurn) -> Result<Option<TurnOutcome>, AppError> {
        let Some(user_message) = self
            .database
            .messages()
            .get_by_request_id(&turn.request_id)
            .await?
        else {
            return Ok(None);
        };

        self.replay_outcome(&turn.user_id, user_message)
            .await
            .map(Some)
    }

    /// Rebuild a turn outcome from a previously stored user message
    async fn replay_outcome(
        &self,
        user_id: &str,
        user_message: MessageRecord,
    ) -> Result<TurnOutcome, AppError> {
        let assistant_message = self
            .database
            .messages()
            .find_assistant_child(&user_message.id)
            .await?
            .ok_or_else(AppError::idempotent_response_missing)?;

        // Request ids are unique system-wide; a stored pair that does not
        // resolve for this owner belongs to someone else's turn
        let conversation = self
            .database
            .conversations()
            .get(&user_message.conversation_id, user_id)
            .await?
            .ok_or_else(|| AppError::invalid_input("Request ID already in use"))?;

        let model =
            selection_from_message(&assistant_message).unwrap_or_else(ModelSelection::system_default);

        Ok(TurnOutcome {
            conversation,
            user_message,
            assistant_message,
            model,
            idempotent_replay: true,
            created_conversation: false,
        })
    }

    /// Write the turn's message pair, root pointer, and usage count
    async fn persist(
        &self,
        turn: &ValidatedTurn,
        assistant_content: &str,
        served: &ModelSelection,
    ) -> Result<TurnOutcome, AppError> {
        let messages = self.database.messages();
        let conversations = self.database.conversations();

        let inserted = messages
            .insert(NewMessage {
                conversation_id: &turn.conversation.id,
                role: MessageRole::User,
                content: &turn.content,
                parent_message_id: turn.parent_message_id.as_deref(),
                branch_id: turn.branch_id.as_deref(),
                model_provider: Some(turn.model.provider.as_str()),
                model_name: Some(&turn.model.name),
                reasoning_tier: turn.model.reasoning.map(ReasoningTier::as_str),
                request_id: Some(&turn.request_id),
            })
            .await?;

        let user_message = match inserted {
            Some(message) => message,
            None => {
                // Lost the insert race to a concurrent duplicate; answer
                // from the winner's rows
                warn!(request_id = %turn.request_id, "Concurrent duplicate turn detected");
                let winner = messages
                    .get_by_request_id(&turn.request_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::internal("Duplicate request disappeared during conflict handling")
                    })?;
                return self.replay_outcome(&turn.user_id, winner).await;
            }
        };

        if turn.conversation.root_message_id.is_none() && turn.parent_message_id.is_none() {
            conversations
                .set_root_message(&turn.conversation.id, &user_message.id)
                .await?;
        }

        let assistant_message = messages
            .insert(NewMessage {
                conversation_id: &turn.conversation.id,
                role: MessageRole::Assistant,
                content: assistant_content,
                parent_message_id: Some(&user_message.id),
                branch_id: turn.branch_id.as_deref(),
                model_provider: Some(served.provider.as_str()),
                model_name: Some(&served.name),
                reasoning_tier: served.reasoning.map(ReasoningTier::as_str),
                request_id: None,
            })
            .await?
            .ok_or_else(|| AppError::internal("Assistant message insert conflicted"))?;

        self.usage_gate.record(&turn.user_id, turn.plan).await?;
        conversations.touch(&turn.conversation.id).await?;

        let conversation = conversations
            .get(&turn.conversation.id, &turn.user_id)
            .await?
            .ok_or_else(|| AppError::internal("Conversation disappeared during turn"))?;

        Ok(TurnOutcome {
            conversation,
            user_message,
            assistant_message,
            model: served.clone(),
            idempotent_replay: false,
            created_conversation: turn.created_conversation,
        })
    }

    /// Kick off best-effort title generation for a new conversation
    fn spawn_title_task(&self, conversation_id: &str, content: &str) {
        let titles = self.titles.clone();
        let conversation_id = conversation_id.to_owned();
        let content = content.to_owned();
        tokio::spawn(async move {
            titles.assign(&conversation_id, &content).await;
        });
    }
}

/// Reconstruct a model selection from a stored message's model fields
fn selection_from_message(message: &MessageRecord) -> Option<ModelSelection> {
    let provider = Provider::parse(message.model_provider.as_deref()?)?;
    let name = message.model_name.clone()?;
    let mut selection = ModelSelection::new(provider, name);
    selection.reasoning = message
        .reasoning_tier
        .as_deref()
        .and_then(ReasoningTier::parse);
    Some(selection)
}
