// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ToolLoop (C7): the tool-calling iteration state machine.
//!
//! Grounded in the teacher's `run_agentic_loop` three-phase shape (push
//! assistant tool-call message → execute → push tool-result messages,
//! bounded by a round counter forcing a final tool-free turn) from
//! `sven-core::agent`, but replaces its stall-nudge heuristics with the
//! fixed `StopReason` taxonomy and synthetic-closure guarantee below.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use agentcore_config::{RouterConfig, ToolLoopConfig};
use agentcore_model::{CompletionRequest, CompletionResponse, ModelProvider, ProviderError};
use agentcore_tools::{ToolPolicy, ToolRegistry};

use crate::context::{StopReason, ToolExecutionOutcome, ToolStatus, TurnContext};
use crate::diagnostics::LoopTrace;
use crate::executor::ToolExecutor;
use crate::message::{Message, Session, ToolCall as CoreToolCall};
use crate::ports::ChannelPort;
use crate::request_view::{self, ProviderKey, RemapRegistry};
use crate::router;
use crate::tier_upgrade;

/// Everything `ToolLoop::run` needs beyond the turn/session state it mutates.
pub struct ToolLoopDeps<'a> {
    pub registry: &'a ToolRegistry,
    pub policy: &'a ToolPolicy,
    pub channel: &'a dyn ChannelPort,
    pub provider: &'a dyn ModelProvider,
    pub remap_registry: &'a mut RemapRegistry,
    pub router_cfg: &'a RouterConfig,
    pub model_table: &'a [(&'a str, agentcore_config::ModelTableEntry)],
    pub tool_cfg: &'a ToolLoopConfig,
    pub confirmation_timeout: Duration,
    pub max_tool_result_chars: usize,
    pub chars_per_token: f32,
    pub chat_id: &'a str,
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub stop_reason: StopReason,
}

#[derive(Debug)]
enum CallError {
    ContextOverflow(String),
    NonRetryable(String),
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate_limit",
    "token_quota_exceeded",
    "too_many_tokens",
    "too many requests",
    "429",
];

fn is_rate_limit_error(e: &ProviderError) -> bool {
    if matches!(e, ProviderError::RateLimited(_)) {
        return true;
    }
    let text = e.to_string().to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| text.contains(m))
}

async fn call_llm_with_retry(
    provider: &dyn ModelProvider,
    request: CompletionRequest,
    cfg: &ToolLoopConfig,
) -> Result<CompletionResponse, CallError> {
    let mut attempt = 0u32;
    loop {
        match provider.chat(request.clone()).await {
            Ok(r) => return Ok(r),
            Err(ProviderError::ContextLengthExceeded(msg)) => return Err(CallError::ContextOverflow(msg)),
            Err(e) => {
                if is_rate_limit_error(&e) && attempt < cfg.rate_limit_retry_max_attempts {
                    let backoff_ms = cfg.rate_limit_retry_base_ms.saturating_mul(1u64 << attempt.min(20));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                    continue;
                }
                return Err(CallError::NonRetryable(e.to_string()));
            }
        }
    }
}

fn canonicalize_json(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, String)> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize_json(v))).collect();
            entries.sort();
            let body = entries.iter().map(|(k, v)| format!("{k:?}:{v}")).collect::<Vec<_>>().join(",");
            format!("{{{body}}}")
        }
        serde_json::Value::Array(items) => {
            let body = items.iter().map(canonicalize_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

fn map_reason_to_status(reason: StopReason) -> (ToolStatus, &'static str, &'static str) {
    match reason {
        StopReason::MaxIterations => (ToolStatus::Skipped, "MAX_ITERATIONS", "skipped: tool-call budget exhausted for this turn"),
        StopReason::Deadline => (ToolStatus::Timeout, "DEADLINE", "not run: turn deadline reached"),
        StopReason::RepeatGuard => (ToolStatus::Blocked, "REPEAT_GUARD", "blocked: this exact call has been repeated too many times"),
        StopReason::ToolFailurePolicy => (ToolStatus::Skipped, "TOOL_FAILURE_POLICY", "skipped: too many tool calls have failed this turn"),
        StopReason::UserCancelled => (ToolStatus::Blocked, "USER_CANCELLED", "blocked: the turn was cancelled"),
        StopReason::FinalAnswer => (ToolStatus::Skipped, "UNKNOWN", "skipped"),
    }
}

fn synthetic_outcome(tc: &CoreToolCall, reason: StopReason) -> ToolExecutionOutcome {
    let (status, error_code, text) = map_reason_to_status(reason);
    ToolExecutionOutcome {
        tool_call_id: tc.id.clone(),
        tool_name: tc.name.clone(),
        status,
        result_text: text.to_string(),
        error_code: Some(error_code.to_string()),
        duration_ms: 0,
        synthetic: true,
        truncated: false,
        attachment: None,
    }
}

/// Outcome for a call beyond `maxToolCallsPerIteration`: unlike the
/// `StopReason` synthetic outcomes above, this doesn't end the turn — the
/// model simply asked for more calls in one round than this iteration's
/// budget allows, so the rest wait for the next round-trip.
fn per_iteration_cap_outcome(tc: &CoreToolCall) -> ToolExecutionOutcome {
    ToolExecutionOutcome {
        tool_call_id: tc.id.clone(),
        tool_name: tc.name.clone(),
        status: ToolStatus::Skipped,
        result_text: "skipped: this iteration's tool-call budget was reached; retry next round".into(),
        error_code: Some("MAX_TOOL_CALLS_PER_ITERATION".into()),
        duration_ms: 0,
        synthetic: true,
        truncated: false,
        attachment: None,
    }
}

fn reason_text(reason: StopReason) -> &'static str {
    match reason {
        StopReason::MaxIterations => "it reached the maximum number of tool-call rounds for this turn",
        StopReason::Deadline => "it reached the turn's time budget",
        StopReason::RepeatGuard => "the same tool call was repeated too many times",
        StopReason::ToolFailurePolicy => "too many tool calls failed",
        StopReason::UserCancelled => "the user cancelled this turn",
        StopReason::FinalAnswer => "it finished",
    }
}

fn build_closure_summary(reason: StopReason, iterations: u32, not_run: &[&ToolExecutionOutcome]) -> String {
    if not_run.is_empty() {
        format!("Stopped after {iterations} tool-call round(s) because {}.", reason_text(reason))
    } else {
        let names: Vec<String> = not_run.iter().map(|o| format!("{}", o.tool_name)).collect();
        format!(
            "Stopped after {iterations} tool-call round(s) because {}; {} tool call(s) not run: {}.",
            reason_text(reason),
            not_run.len(),
            names.join(", ")
        )
    }
}

/// Runs the tool-call loop until a final answer, or a stop condition forces
/// synthetic closure, appending every message to both `ctx.messages` (the
/// working view) and `session` (the canonical append-only log).
pub async fn run(ctx: &mut TurnContext, session: &mut Session, deps: &mut ToolLoopDeps<'_>) -> ToolLoopOutcome {
    let mut repeat_counts: HashMap<(String, String), u32> = HashMap::new();
    let mut tool_failures_total: u32 = 0;
    let mut all_outcomes: Vec<ToolExecutionOutcome> = Vec::new();

    loop {
        if ctx.is_cancelled() {
            return finalize_no_llm(ctx, session, StopReason::UserCancelled, &all_outcomes);
        }
        if ctx.deadline_exceeded() {
            return finalize_no_llm(ctx, session, StopReason::Deadline, &all_outcomes);
        }

        let capabilities = router::resolve_capabilities(&ctx.selected_model, deps.model_table);
        let provider_key = ProviderKey::for_provider(capabilities.provider.clone());

        let (view, diagnostics) = match request_view::build_view(
            &ctx.messages,
            deps.remap_registry,
            &provider_key,
            capabilities.max_input_tokens,
            deps.chars_per_token,
        ) {
            Ok(v) => v,
            Err(e) => {
                ctx.stage_error = Some(crate::context::StageError {
                    stage: "ToolLoop".into(),
                    cause: e.to_string(),
                });
                return finalize_fatal_error(ctx, session, "I couldn't build a request for the model because the conversation history is inconsistent.", &all_outcomes);
            }
        };
        record_view_diagnostics(ctx, &diagnostics);

        let tools = deps.registry.schemas();
        let request = CompletionRequest {
            model: ctx.selected_model.clone(),
            reasoning_effort: if capabilities.reasoning_required { ctx.reasoning_effort.clone() } else { None },
            temperature: if capabilities.supports_temperature { Some(deps.router_cfg.temperature) } else { None },
            messages: view,
            tools: tools
                .into_iter()
                .map(|s| agentcore_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect(),
            timeout_ms: deps.tool_cfg.llm_request_timeout_ms,
        };

        let response = match call_llm_with_retry(deps.provider, request.clone(), deps.tool_cfg).await {
            Ok(r) => r,
            Err(CallError::ContextOverflow(_)) => match retry_with_tighter_budget(ctx, deps, &request, &capabilities).await {
                Ok(r) => r,
                Err(()) => {
                    return finalize_fatal_error(
                        ctx,
                        session,
                        "I couldn't finish this turn because the conversation is too long for the model's context window.",
                        &all_outcomes,
                    );
                }
            },
            Err(CallError::NonRetryable(msg)) => {
                ctx.llm_error = Some(msg.clone());
                return finalize_fatal_error(ctx, session, &format!("I ran into an error calling the model: {msg}"), &all_outcomes);
            }
        };

        if response.tool_calls.is_empty() {
            let msg = Message::assistant(response.content.clone());
            ctx.messages.push(msg.clone());
            session.push(msg);
            ctx.final_answer_ready = true;
            ctx.loop_decision = Some(crate::context::LoopDecision { continue_: false, reason: StopReason::FinalAnswer });
            ctx.diagnostics.record_loop_trace(LoopTrace {
                iterations: ctx.iteration,
                stop_reason: StopReason::FinalAnswer,
                outcomes: all_outcomes,
            });
            return ToolLoopOutcome { stop_reason: StopReason::FinalAnswer };
        }

        ctx.iteration += 1;

        let tool_calls_raw: Vec<CoreToolCall> = response
            .tool_calls
            .iter()
            .map(|tc| {
                let args: serde_json::Value = serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::Value::Null);
                CoreToolCall::new(tc.id.clone(), tc.function.name.clone(), args)
            })
            .collect();
        let assistant_msg = Message::assistant_with_tool_calls(response.content.clone(), tool_calls_raw.clone());
        ctx.messages.push(assistant_msg.clone());
        session.push(assistant_msg);

        let mut batch_stop: Option<StopReason> = None;
        if ctx.iteration >= deps.tool_cfg.max_iterations {
            batch_stop = Some(StopReason::MaxIterations);
        }

        let cap = deps.tool_cfg.max_tool_calls_per_iteration.map(|n| n as usize).unwrap_or(tool_calls_raw.len());
        let (runnable, overflow) = tool_calls_raw.split_at(cap.min(tool_calls_raw.len()));

        let mut batch_outcomes = if deps.tool_cfg.parallel_tools {
            run_batch_parallel(deps, runnable, ctx.turn_deadline, batch_stop, &mut repeat_counts).await
        } else {
            run_batch_sequential(deps, runnable, ctx, batch_stop, &mut repeat_counts, &mut tool_failures_total).await
        };
        batch_outcomes.extend(overflow.iter().map(per_iteration_cap_outcome));

        let mut stop = batch_stop;
        for outcome in &batch_outcomes {
            if !outcome.synthetic && outcome.is_failure() {
                // Accounted for inside run_batch_sequential already; parallel mode
                // tallies failures here so ToolFailurePolicy can trip on the *next*
                // iteration even though this batch already committed to running.
                if deps.tool_cfg.parallel_tools {
                    tool_failures_total += 1;
                    if stop.is_none() && tool_failures_total > deps.tool_cfg.max_tool_failures {
                        stop = Some(StopReason::ToolFailurePolicy);
                    }
                }
            }
        }

        for outcome in &batch_outcomes {
            let msg = Message::tool_result(outcome.tool_call_id.clone(), outcome.tool_name.clone(), outcome.result_text.clone());
            ctx.messages.push(msg.clone());
            session.push(msg);
        }
        all_outcomes.extend(batch_outcomes.clone());

        apply_tier_upgrade(ctx, deps, session);

        if let Some(reason) = stop {
            let not_run: Vec<&ToolExecutionOutcome> = batch_outcomes.iter().filter(|o| o.synthetic).collect();
            let summary = build_closure_summary(reason, ctx.iteration, &not_run);
            let final_msg = Message::assistant(summary);
            ctx.messages.push(final_msg.clone());
            session.push(final_msg);
            ctx.final_answer_ready = true;
            ctx.loop_decision = Some(crate::context::LoopDecision { continue_: false, reason });
            ctx.diagnostics.record_loop_trace(LoopTrace { iterations: ctx.iteration, stop_reason: reason, outcomes: all_outcomes });
            return ToolLoopOutcome { stop_reason: reason };
        }
    }
}

async fn run_batch_sequential(
    deps: &ToolLoopDeps<'_>,
    calls: &[CoreToolCall],
    ctx: &TurnContext,
    mut stop: Option<StopReason>,
    repeat_counts: &mut HashMap<(String, String), u32>,
    tool_failures_total: &mut u32,
) -> Vec<ToolExecutionOutcome> {
    let executor = ToolExecutor {
        registry: deps.registry,
        policy: deps.policy,
        channel: deps.channel,
        tool_cfg: deps.tool_cfg,
        confirmation_timeout: deps.confirmation_timeout,
        max_tool_result_chars: deps.max_tool_result_chars,
    };

    let mut outcomes = Vec::with_capacity(calls.len());
    for tc in calls {
        if stop.is_none() && ctx.deadline_exceeded() {
            stop = Some(StopReason::Deadline);
        }
        if stop.is_none() && ctx.is_cancelled() {
            stop = Some(StopReason::UserCancelled);
        }
        if stop.is_none() {
            let key = (tc.name.clone(), canonicalize_json(&tc.arguments));
            let count = repeat_counts.entry(key).or_insert(0);
            *count += 1;
            if *count >= deps.tool_cfg.repeat_guard_threshold {
                stop = Some(StopReason::RepeatGuard);
            }
        }

        if let Some(reason) = stop {
            outcomes.push(synthetic_outcome(tc, reason));
            continue;
        }

        let outcome = executor.execute(tc, deps.chat_id, ctx.turn_deadline).await;
        if outcome.is_failure() {
            *tool_failures_total += 1;
            if *tool_failures_total > deps.tool_cfg.max_tool_failures {
                stop = Some(StopReason::ToolFailurePolicy);
            }
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Parallel mode pre-scans deadline/cancellation/repeat-guard (they don't
/// depend on execution results) before launching the runnable calls
/// concurrently. `ToolFailurePolicy` can only be evaluated after results are
/// in, so in this mode it affects the *next* batch rather than cutting the
/// current one short mid-flight — a documented relaxation of the sequential
/// guarantee, traded for concurrency.
async fn run_batch_parallel(
    deps: &ToolLoopDeps<'_>,
    calls: &[CoreToolCall],
    turn_deadline: Instant,
    mut stop: Option<StopReason>,
    repeat_counts: &mut HashMap<(String, String), u32>,
) -> Vec<ToolExecutionOutcome> {
    let executor = ToolExecutor {
        registry: deps.registry,
        policy: deps.policy,
        channel: deps.channel,
        tool_cfg: deps.tool_cfg,
        confirmation_timeout: deps.confirmation_timeout,
        max_tool_result_chars: deps.max_tool_result_chars,
    };

    let mut plan: Vec<Result<(), StopReason>> = Vec::with_capacity(calls.len());
    for tc in calls {
        if stop.is_none() && Instant::now() > turn_deadline {
            stop = Some(StopReason::Deadline);
        }
        if stop.is_none() {
            let key = (tc.name.clone(), canonicalize_json(&tc.arguments));
            let count = repeat_counts.entry(key).or_insert(0);
            *count += 1;
            if *count >= deps.tool_cfg.repeat_guard_threshold {
                stop = Some(StopReason::RepeatGuard);
            }
        }
        plan.push(stop.map_or(Ok(()), Err));
    }

    let call_futures = calls.iter().zip(plan.into_iter()).map(|(tc, decision)| {
        let executor = executor;
        async move {
            match decision {
                Err(reason) => synthetic_outcome(tc, reason),
                Ok(()) => executor.execute(tc, deps.chat_id, turn_deadline).await,
            }
        }
    });
    futures::future::join_all(call_futures).await
}

async fn retry_with_tighter_budget(
    ctx: &mut TurnContext,
    deps: &mut ToolLoopDeps<'_>,
    original: &CompletionRequest,
    capabilities: &agentcore_config::ModelTableEntry,
) -> Result<CompletionResponse, ()> {
    let tight_tokens = (capabilities.max_input_tokens / 4).max(1_000);
    let provider_key = ProviderKey::for_provider(capabilities.provider.clone());
    let (view, diagnostics) = match request_view::build_view(&ctx.messages, deps.remap_registry, &provider_key, tight_tokens, deps.chars_per_token) {
        Ok(v) => v,
        Err(_) => return Err(()),
    };
    record_view_diagnostics(ctx, &diagnostics);
    let request = CompletionRequest { messages: view, ..original.clone() };
    call_llm_with_retry(deps.provider, request, deps.tool_cfg).await.map_err(|_| ())
}

fn record_view_diagnostics(ctx: &mut TurnContext, diagnostics: &request_view::ViewDiagnostics) {
    if diagnostics.flattened_count > 0 {
        ctx.diagnostics.record_masking(crate::diagnostics::MaskingRecord {
            flattened_count: diagnostics.flattened_count,
            reason: diagnostics.masking_reason.clone().unwrap_or_else(|| "provider_switch".into()),
        });
    }
    for _ in 0..diagnostics.truncated_messages {
        ctx.diagnostics.record_truncation(crate::diagnostics::TruncationRecord {
            tool_call_id: "<view-emergency-truncation>".into(),
            total_chars: 0,
            shown_chars: 0,
        });
    }
}

fn apply_tier_upgrade(ctx: &mut TurnContext, deps: &ToolLoopDeps<'_>, session: &Session) {
    if !deps.router_cfg.dynamic_tier_enabled {
        return;
    }
    let since = session.messages_since_last_user();
    if let Some(new_tier) = tier_upgrade::recommended_tier(ctx.model_tier, ctx.tier_preference.force, since) {
        let from = ctx.model_tier;
        if ctx.try_upgrade_tier(new_tier) {
            ctx.diagnostics.record_tier_decision(crate::diagnostics::TierDecision {
                from,
                to: new_tier,
                reason: "coding signal detected in recent tool activity".into(),
            });
            let upgraded_pref = crate::context::TierPreference { tier: new_tier, force: false };
            let resolved = router::resolve(upgraded_pref, None, deps.router_cfg, deps.model_table);
            ctx.selected_model = resolved.model;
            ctx.reasoning_effort = resolved.reasoning_effort;
        }
    }
}

fn finalize_no_llm(ctx: &mut TurnContext, session: &mut Session, reason: StopReason, all_outcomes: &[ToolExecutionOutcome]) -> ToolLoopOutcome {
    let summary = build_closure_summary(reason, ctx.iteration, &[]);
    let msg = Message::assistant(summary);
    ctx.messages.push(msg.clone());
    session.push(msg);
    ctx.final_answer_ready = true;
    ctx.loop_decision = Some(crate::context::LoopDecision { continue_: false, reason });
    ctx.diagnostics.record_loop_trace(LoopTrace { iterations: ctx.iteration, stop_reason: reason, outcomes: all_outcomes.to_vec() });
    ToolLoopOutcome { stop_reason: reason }
}

fn finalize_fatal_error(ctx: &mut TurnContext, session: &mut Session, text: &str, all_outcomes: &[ToolExecutionOutcome]) -> ToolLoopOutcome {
    let msg = Message::assistant(text);
    ctx.messages.push(msg.clone());
    session.push(msg);
    ctx.final_answer_ready = true;
    ctx.loop_decision = Some(crate::context::LoopDecision { continue_: false, reason: StopReason::FinalAnswer });
    ctx.diagnostics.record_loop_trace(LoopTrace {
        iterations: ctx.iteration,
        stop_reason: StopReason::FinalAnswer,
        outcomes: all_outcomes.to_vec(),
    });
    ToolLoopOutcome { stop_reason: StopReason::FinalAnswer }
}
