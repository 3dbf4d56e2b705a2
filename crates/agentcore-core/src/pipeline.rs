// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pipeline (C8): the stage list every inbound turn runs through, from
//! admission control to the outbound reply.
//!
//! Built once per running instance as a `Vec<Box<dyn PipelineStage>>`
//! (constructor composition, matching the teacher's preference for an
//! explicit list of collaborators over a dynamically discovered chain) and
//! driven by [`Pipeline::run_turn`] once per turn. `RateLimiter` admission
//! happens ahead of the stage list entirely — a denied turn never touches a
//! tool, the model, or the canonical log. Stages after `ToolLoop` only run
//! once `ctx.final_answer_ready` is set; `RagIndex` is a standing placeholder
//! for retrieval-augmented memory, which is an external concern this crate
//! does not implement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use agentcore_config::{Config, ModelTableEntry};
use agentcore_model::ModelProvider;
use agentcore_tools::{ToolPolicy, ToolRegistry};

use crate::compactor;
use crate::context::{Attachment, StageError, TierPreference, TurnContext};
use crate::diagnostics::TierDecision;
use crate::message::{Message, Session};
use crate::outbound::OutboundSender;
use crate::ports::{ChannelPort, SessionStore, TurnLockRegistry};
use crate::rate_limiter::{try_consume_default_scopes, RateLimiter};
use crate::request_view::RemapRegistry;
use crate::router;
use crate::sanitizer::{self, ThreatPatterns};
use crate::tier_upgrade;
use crate::tool_loop::{self, ToolLoopDeps};

/// Outbound chunk cap used when no channel-specific limit is configured.
/// Mirrors the size `outbound`'s own tests exercise.
const DEFAULT_CHANNEL_MAX_CHARS: usize = 4_096;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("turn aborted before any stage ran: {reason}")]
    PipelineAborted { reason: String },
    #[error("stage {stage} failed: {cause}")]
    StageFailed { stage: String, cause: String },
}

/// Everything a stage needs beyond the `TurnContext` it mutates. Holds
/// `&mut` borrows scoped to one turn plus a couple of turn-scratch fields
/// (`pending_user_text`, `compaction_replay`) that later stages consume.
pub struct StageInputs<'a> {
    pub session: &'a mut Session,
    pub config: &'a Config,
    pub registry: &'a ToolRegistry,
    pub policy: &'a ToolPolicy,
    pub channel: &'a dyn ChannelPort,
    pub provider: &'a dyn ModelProvider,
    pub session_store: &'a dyn SessionStore,
    pub rate_limiter: &'a RateLimiter,
    pub remap_registry: &'a mut RemapRegistry,
    pub model_table: &'a [(&'a str, ModelTableEntry)],
    pub chat_id: &'a str,
    pub channel_type: &'a str,
    pub conversation_key: &'a str,
    /// The not-yet-persisted inbound text, taken by `Sanitize` the moment it
    /// runs. `None` for every stage after that.
    pub pending_user_text: &'a mut Option<String>,
    /// Length of the session's raw log at turn start, before this turn's own
    /// messages were appended — `MemoryPersist`'s replay baseline.
    pub baseline_len: usize,
    /// Set by `Compact` when it collapses a prefix this turn, so
    /// `MemoryPersist` can replay the identical edit onto `session_store`.
    pub compaction_replay: &'a mut Option<(usize, Message)>,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;
    /// Whether this stage runs at all for the current turn state. Checked
    /// before `process` on every stage, every turn.
    fn should_process(&self, ctx: &TurnContext) -> bool;
    async fn process(&self, ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError>;
}

struct SanitizeStage;

#[async_trait]
impl PipelineStage for SanitizeStage {
    fn name(&self) -> &str {
        "Sanitize"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        !ctx.final_answer_ready
    }

    async fn process(&self, _ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        let Some(original) = inputs.pending_user_text.take() else {
            return Ok(());
        };
        let outcome = sanitizer::sanitize(&original, &ThreatPatterns::default());
        let mut message = Message::user(outcome.content.clone());
        if outcome.was_mutated() {
            message.metadata = sanitizer::audit_metadata(&original, &outcome);
        }
        inputs.session.push(message);
        Ok(())
    }
}

struct CompactStage;

#[async_trait]
impl PipelineStage for CompactStage {
    fn name(&self) -> &str {
        "Compact"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        !ctx.final_answer_ready
    }

    async fn process(&self, _ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        let cfg = &inputs.config.compaction;
        if !cfg.enabled {
            return Ok(());
        }
        // Compaction always measures against the balanced model's budget,
        // independent of whichever tier this turn eventually selects.
        let capabilities = router::resolve_capabilities(&inputs.config.router.balanced_model, inputs.model_table);
        let keep_last = cfg.keep_last_messages.min(inputs.session.len());
        let prefix_len = inputs.session.len().saturating_sub(keep_last);

        match compactor::maybe_compact(
            inputs.session,
            cfg,
            capabilities.max_input_tokens,
            &inputs.config.router.balanced_model,
            inputs.config.router.balanced_reasoning.as_deref(),
            inputs.provider,
        )
        .await
        {
            Ok(Some(outcome)) => {
                if let Some(summary) = inputs.session.messages().first().cloned() {
                    *inputs.compaction_replay = Some((prefix_len, summary));
                }
                tracing::info!(
                    strategy = ?outcome.strategy_used,
                    tokens_before = outcome.tokens_before,
                    tokens_after = outcome.tokens_after,
                    "compacted session"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(StageError {
                stage: "Compact".into(),
                cause: e.to_string(),
            }),
        }
    }
}

struct ContextBuildStage;

#[async_trait]
impl PipelineStage for ContextBuildStage {
    fn name(&self) -> &str {
        "ContextBuild"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        !ctx.final_answer_ready
    }

    async fn process(&self, ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        ctx.messages = inputs.session.messages().to_vec();
        ctx.model_tier = router::resolve_tier(ctx.tier_preference, None);
        let resolved = router::resolve(ctx.tier_preference, None, &inputs.config.router, inputs.model_table);
        ctx.selected_model = resolved.model;
        ctx.reasoning_effort = resolved.reasoning_effort;
        Ok(())
    }
}

struct DynamicTierStage;

#[async_trait]
impl PipelineStage for DynamicTierStage {
    fn name(&self) -> &str {
        "DynamicTier"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        !ctx.final_answer_ready
    }

    async fn process(&self, ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        if !inputs.config.router.dynamic_tier_enabled {
            return Ok(());
        }
        let since = inputs.session.messages_since_last_user();
        if let Some(candidate) = tier_upgrade::recommended_tier(ctx.model_tier, ctx.tier_preference.force, since) {
            let from = ctx.model_tier;
            if ctx.try_upgrade_tier(candidate) {
                ctx.diagnostics.record_tier_decision(TierDecision {
                    from,
                    to: candidate,
                    reason: "coding signal detected before the tool loop started".into(),
                });
                let resolved = router::resolve(
                    TierPreference { tier: candidate, force: false },
                    None,
                    &inputs.config.router,
                    inputs.model_table,
                );
                ctx.selected_model = resolved.model;
                ctx.reasoning_effort = resolved.reasoning_effort;
            }
        }
        Ok(())
    }
}

struct ToolLoopStage;

#[async_trait]
impl PipelineStage for ToolLoopStage {
    fn name(&self) -> &str {
        "ToolLoop"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        !ctx.final_answer_ready
    }

    async fn process(&self, ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        let mut deps = ToolLoopDeps {
            registry: inputs.registry,
            policy: inputs.policy,
            channel: inputs.channel,
            provider: inputs.provider,
            remap_registry: inputs.remap_registry,
            router_cfg: &inputs.config.router,
            model_table: inputs.model_table,
            tool_cfg: &inputs.config.tool_loop,
            confirmation_timeout: Duration::from_secs(inputs.config.tools.confirmation_timeout_secs),
            max_tool_result_chars: inputs.config.compaction.max_tool_result_chars,
            chars_per_token: inputs.config.compaction.chars_per_token,
            chat_id: inputs.chat_id,
        };
        tool_loop::run(ctx, inputs.session, &mut deps).await;
        Ok(())
    }
}

struct MemoryPersistStage;

#[async_trait]
impl PipelineStage for MemoryPersistStage {
    fn name(&self) -> &str {
        "MemoryPersist"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        ctx.final_answer_ready
    }

    async fn process(&self, _ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        let mut baseline = inputs.baseline_len;
        if let Some((prefix_len, summary)) = inputs.compaction_replay.take() {
            inputs
                .session_store
                .replace_prefix(inputs.conversation_key, prefix_len, summary)
                .await
                .map_err(|e| StageError {
                    stage: "MemoryPersist".into(),
                    cause: e.to_string(),
                })?;
            // Compact collapsed `prefix_len` pre-compaction messages into one
            // summary, shrinking everything at or after it by `prefix_len - 1`
            // slots. Shift the watermark by the same amount so the "already
            // persisted" boundary still points at this turn's own messages in
            // the post-compaction numbering, instead of past the end of the
            // session entirely.
            baseline = baseline.saturating_sub(prefix_len.saturating_sub(1));
        }
        let tail = inputs.session.messages();
        let start = baseline.min(tail.len());
        let new_messages = tail[start..].to_vec();
        if !new_messages.is_empty() {
            inputs.session_store.append(inputs.conversation_key, new_messages).await;
        }
        Ok(())
    }
}

/// Retrieval-augmented memory indexing is an external collaborator (§1);
/// this stage is a structural placeholder that never fires.
struct RagIndexStage;

#[async_trait]
impl PipelineStage for RagIndexStage {
    fn name(&self) -> &str {
        "RagIndex"
    }

    fn should_process(&self, _ctx: &TurnContext) -> bool {
        false
    }

    async fn process(&self, _ctx: &mut TurnContext, _inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        Ok(())
    }
}

struct RouteStage;

#[async_trait]
impl PipelineStage for RouteStage {
    fn name(&self) -> &str {
        "Route"
    }

    fn should_process(&self, ctx: &TurnContext) -> bool {
        ctx.final_answer_ready || ctx.stage_error.is_some()
    }

    async fn process(&self, ctx: &mut TurnContext, inputs: &mut StageInputs<'_>) -> Result<(), StageError> {
        let sender = OutboundSender {
            channel: inputs.channel,
            limiter: inputs.rate_limiter,
            channel_type: inputs.channel_type,
            channel_messages_per_second: inputs.config.rate_limit.channel_messages_per_second,
            max_chars: DEFAULT_CHANNEL_MAX_CHARS,
        };

        // A stage upstream of ToolLoop failed outright (no final assistant
        // message exists to deliver) — report the failure itself instead of
        // trying to read ctx.messages.
        if let Some(stage_error) = &ctx.stage_error {
            let text = format!(
                "Sorry, something went wrong while handling your message (stage {}: {}).",
                stage_error.stage, stage_error.cause
            );
            return sender.send_turn(inputs.chat_id, &text, &[]).await.map_err(|e| StageError {
                stage: "Route".into(),
                cause: e.to_string(),
            });
        }

        let Some(last) = ctx.messages.last() else {
            return Ok(());
        };
        let text = last.content.clone();
        let attachments: Vec<Attachment> = ctx
            .diagnostics
            .loop_traces()
            .last()
            .map(|trace| trace.outcomes.iter().filter_map(|o| o.attachment.clone()).collect())
            .unwrap_or_default();

        sender
            .send_turn(inputs.chat_id, &text, &attachments)
            .await
            .map_err(|e| StageError {
                stage: "Route".into(),
                cause: e.to_string(),
            })
    }
}

fn default_stages() -> Vec<Box<dyn PipelineStage>> {
    vec![
        Box::new(SanitizeStage),
        Box::new(CompactStage),
        Box::new(ContextBuildStage),
        Box::new(DynamicTierStage),
        Box::new(ToolLoopStage),
        Box::new(MemoryPersistStage),
        Box::new(RagIndexStage),
        Box::new(RouteStage),
    ]
}

/// Constructed once at startup and reused for every turn. Owns the
/// long-lived collaborators (tool registry, policy, rate limiter, turn
/// locks, per-conversation tool-call id remap tables) that outlive any
/// single `TurnContext`.
pub struct Pipeline {
    config: Config,
    registry: ToolRegistry,
    policy: ToolPolicy,
    channel: Arc<dyn ChannelPort>,
    provider: Arc<dyn ModelProvider>,
    session_store: Arc<dyn SessionStore>,
    rate_limiter: RateLimiter,
    turn_locks: TurnLockRegistry,
    /// Keyed by conversation key rather than held as one global registry so
    /// a turn only takes this lock briefly, never across an `.await`.
    remap_registries: Mutex<HashMap<String, RemapRegistry>>,
    model_table: Vec<(String, ModelTableEntry)>,
    channel_type: String,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        registry: ToolRegistry,
        channel: Arc<dyn ChannelPort>,
        provider: Arc<dyn ModelProvider>,
        session_store: Arc<dyn SessionStore>,
        channel_type: impl Into<String>,
    ) -> Self {
        let policy = ToolPolicy::from_config(&config.tools);
        let model_table = config.llm.models.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Self {
            config,
            registry,
            policy,
            channel,
            provider,
            session_store,
            rate_limiter: RateLimiter::new(),
            turn_locks: TurnLockRegistry::new(),
            remap_registries: Mutex::new(HashMap::new()),
            model_table,
            channel_type: channel_type.into(),
            stages: default_stages(),
        }
    }

    /// Runs one inbound turn to completion: admission control, then the
    /// stage list in order, then delivery. Serialized per `conversation_key`
    /// by `TurnLockRegistry` so session invariants hold under concurrent
    /// inbound messages for the same conversation (§5).
    pub async fn run_turn(
        &self,
        conversation_key: &str,
        chat_id: &str,
        inbound_text: impl Into<String>,
        tier_preference: TierPreference,
        cancellation: watch::Receiver<bool>,
    ) -> Result<TurnContext, PipelineError> {
        let lock = self.turn_locks.lock_for(conversation_key);
        let _guard = lock.lock().await;

        let mut session = self
            .session_store
            .load(conversation_key)
            .await
            .unwrap_or_else(|| Session::new(conversation_key));
        let baseline_len = session.len();

        let model_table: Vec<(&str, ModelTableEntry)> =
            self.model_table.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let initial = router::resolve(tier_preference, None, &self.config.router, &model_table);
        let admission = try_consume_default_scopes(
            &self.rate_limiter,
            &self.config.rate_limit,
            &self.channel_type,
            &initial.capabilities.provider,
        );
        if !admission.allowed {
            return Err(PipelineError::PipelineAborted {
                reason: format!("rate limit exceeded, retry in {:?}", admission.wait_hint.unwrap_or_default()),
            });
        }

        let turn_deadline = Instant::now() + Duration::from_millis(self.config.tool_loop.turn_deadline_ms);
        let mut ctx = TurnContext::new(conversation_key, Vec::new(), turn_deadline, cancellation);
        ctx.tier_preference = tier_preference;

        let mut pending_user_text = Some(inbound_text.into());
        let mut compaction_replay = None;
        let mut remap_registry = {
            let mut registries = self.remap_registries.lock();
            registries.remove(conversation_key).unwrap_or_default()
        };

        let result = {
            let mut inputs = StageInputs {
                session: &mut session,
                config: &self.config,
                registry: &self.registry,
                policy: &self.policy,
                channel: self.channel.as_ref(),
                provider: self.provider.as_ref(),
                session_store: self.session_store.as_ref(),
                rate_limiter: &self.rate_limiter,
                remap_registry: &mut remap_registry,
                model_table: &model_table,
                chat_id,
                channel_type: &self.channel_type,
                conversation_key,
                pending_user_text: &mut pending_user_text,
                baseline_len,
                compaction_replay: &mut compaction_replay,
            };

            // §4.1: on a stage error, skip every remaining stage except
            // Route, which still runs (to report the failure to the user)
            // even though the turn never reached `final_answer_ready`.
            let mut outcome: Result<(), PipelineError> = Ok(());
            for stage in &self.stages {
                if outcome.is_err() && stage.name() != "Route" {
                    continue;
                }
                if !stage.should_process(&ctx) {
                    continue;
                }
                if let Err(err) = stage.process(&mut ctx, &mut inputs).await {
                    ctx.stage_error = Some(err.clone());
                    if outcome.is_ok() {
                        outcome = Err(PipelineError::StageFailed { stage: err.stage, cause: err.cause });
                    }
                }
            }
            outcome
        };

        self.remap_registries.lock().insert(conversation_key.to_string(), remap_registry);

        result.map(|()| ctx)
    }
}
