// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Compactor (C5): preventively summarize/drop old messages when estimated
//! tokens breach the model budget.
//!
//! Mirrors the teacher's `compact_session_with_strategy` shape: a
//! `Narrative` (free-form prose) and a `Structured` (fixed Markdown
//! sections) summarization prompt, selected by `CompactionConfig::strategy`,
//! plus a deterministic emergency fallback that never calls the model.

use agentcore_config::{CompactionConfig, CompactionStrategy};
use agentcore_model::{CompletionRequest, Message as WireMessage, ModelProvider, ProviderError};

use crate::message::{Message, Role, Session, SessionError};

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant. Produce a structured state checkpoint from the \
conversation history below. Use EXACTLY the following Markdown sections — do not add or \
remove sections. Be information-dense: preserve file paths, function names, error \
messages, and technical decisions verbatim where they matter.

## Active Task
## Key Decisions & Rationale
## Files & Artifacts
## Constraints & Requirements
## Pending Items
## Session Narrative";

const EMERGENCY_NOTICE: &str =
    "[Context emergency-compacted: earlier history was dropped to prevent a context-window \
     overflow. Ask the user to re-provide any missing requirements if needed.]";

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("summarization call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    Narrative,
    Structured,
    Emergency,
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionOutcome {
    pub strategy_used: CompactionStrategyUsed,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

/// `estimatedTokens = sum(len(m.content))/charsPerToken + systemOverheadTokens`.
pub fn estimate_tokens(messages: &[Message], chars_per_token: f32, system_overhead_tokens: u32) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content.len()
                + m.tool_calls
                    .iter()
                    .map(|tc| tc.name.len() + tc.raw_arguments.len())
                    .sum::<usize>()
        })
        .sum();
    (chars as f32 / chars_per_token).ceil() as u32 + system_overhead_tokens
}

/// `threshold = min(modelMaxInputTokens × 0.80, configuredCap)`.
pub fn compute_threshold(model_max_input_tokens: u32, configured_cap: u32) -> u32 {
    let capped = (model_max_input_tokens as f32 * 0.80) as u32;
    capped.min(configured_cap)
}

fn serialize_for_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = if !m.tool_calls.is_empty() {
                m.tool_calls
                    .iter()
                    .map(|tc| format!("[tool_call: {}({})]", tc.name, tc.raw_arguments))
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                m.content.clone()
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn emergency_compact(session: &mut Session, keep_last: usize) -> Result<(), SessionError> {
    let keep = keep_last.min(session.len());
    let prefix_len = session.len() - keep;
    let summary = Message::system(EMERGENCY_NOTICE).mark_as_compaction_summary();
    session.replace_prefix(prefix_len, summary)
}

async fn summarize_via_llm(
    prompt: &str,
    history_text: &str,
    model: &str,
    reasoning_effort: Option<&str>,
    provider: &dyn ModelProvider,
) -> Result<String, CompactionError> {
    let request = CompletionRequest {
        model: model.to_string(),
        reasoning_effort: reasoning_effort.map(|s| s.to_string()),
        temperature: None,
        messages: vec![WireMessage::user(format!("{prompt}\n\n---\n\n{history_text}"))],
        tools: vec![],
        timeout_ms: 60_000,
    };
    let response = provider.chat(request).await?;
    Ok(response.content)
}

/// Checks the threshold and, if breached, compacts `session` in place. Falls
/// back to deterministic emergency truncation when the prompt alone would
/// overflow 95% of the model's budget, or when the summarization call fails.
pub async fn maybe_compact(
    session: &mut Session,
    cfg: &CompactionConfig,
    model_max_input_tokens: u32,
    balanced_model: &str,
    reasoning_effort: Option<&str>,
    provider: &dyn ModelProvider,
) -> Result<Option<CompactionOutcome>, CompactionError> {
    if !cfg.enabled {
        return Ok(None);
    }
    let tokens_before = estimate_tokens(session.messages(), cfg.chars_per_token, cfg.system_prompt_overhead_tokens);
    let threshold = compute_threshold(model_max_input_tokens, cfg.max_context_tokens);
    if tokens_before <= threshold {
        return Ok(None);
    }

    let keep_last = cfg.keep_last_messages.min(session.len());
    let prefix_len = session.len() - keep_last;
    let prefix = &session.messages()[..prefix_len];
    let history_text = serialize_for_prompt(prefix);
    let prompt_tokens =
        (history_text.len() as f32 / cfg.chars_per_token).ceil() as u32 + cfg.system_prompt_overhead_tokens;
    let would_overflow_even_prompt = prompt_tokens as f32 > model_max_input_tokens as f32 * 0.95;

    if would_overflow_even_prompt {
        emergency_compact(session, cfg.keep_last_messages)?;
        let tokens_after = estimate_tokens(session.messages(), cfg.chars_per_token, cfg.system_prompt_overhead_tokens);
        return Ok(Some(CompactionOutcome {
            strategy_used: CompactionStrategyUsed::Emergency,
            tokens_before,
            tokens_after,
        }));
    }

    let prompt = match cfg.strategy {
        CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
        CompactionStrategy::Narrative => SUMMARIZE_PROMPT,
    };
    match summarize_via_llm(prompt, &history_text, balanced_model, reasoning_effort, provider).await {
        Ok(summary_text) => {
            let summary = Message::system(summary_text).mark_as_compaction_summary();
            session.replace_prefix(prefix_len, summary)?;
            let tokens_after =
                estimate_tokens(session.messages(), cfg.chars_per_token, cfg.system_prompt_overhead_tokens);
            let strategy_used = match cfg.strategy {
                CompactionStrategy::Structured => CompactionStrategyUsed::Structured,
                CompactionStrategy::Narrative => CompactionStrategyUsed::Narrative,
            };
            Ok(Some(CompactionOutcome {
                strategy_used,
                tokens_before,
                tokens_after,
            }))
        }
        Err(_) => {
            emergency_compact(session, cfg.keep_last_messages)?;
            let tokens_after =
                estimate_tokens(session.messages(), cfg.chars_per_token, cfg.system_prompt_overhead_tokens);
            Ok(Some(CompactionOutcome {
                strategy_used: CompactionStrategyUsed::Emergency,
                tokens_before,
                tokens_after,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    fn session_with(n: usize, content_len: usize) -> Session {
        let mut s = Session::new("conv-1");
        for i in 0..n {
            s.push(Message::user(format!("{i}:{}", "x".repeat(content_len))));
        }
        s
    }

    #[test]
    fn estimate_tokens_uses_chars_per_token_and_overhead() {
        let messages = vec![Message::user("1234567890")];
        let tokens = estimate_tokens(&messages, 3.5, 8_000);
        assert_eq!(tokens, 3 + 8_000);
    }

    #[test]
    fn compute_threshold_is_min_of_model_fraction_and_cap() {
        assert_eq!(compute_threshold(100_000, 128_000), 80_000);
        assert_eq!(compute_threshold(200_000, 50_000), 50_000);
    }

    #[tokio::test]
    async fn under_threshold_does_not_compact() {
        let mut session = session_with(5, 10);
        let cfg = CompactionConfig::default();
        let provider = ScriptedProvider::always_text("summary");
        let outcome = maybe_compact(&mut session, &cfg, 128_000, "gpt-4o", None, &provider)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(session.len(), 5);
    }

    #[tokio::test]
    async fn over_threshold_replaces_prefix_with_summary_and_keeps_last_n() {
        let mut session = session_with(50, 2_000);
        let mut cfg = CompactionConfig::default();
        cfg.keep_last_messages = 10;
        let provider = ScriptedProvider::always_text("a dense summary");
        let outcome = maybe_compact(&mut session, &cfg, 128_000, "gpt-4o", None, &provider)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome.strategy_used,
            CompactionStrategyUsed::Structured | CompactionStrategyUsed::Narrative
        ));
        assert_eq!(session.len(), 11);
        assert!(session.messages()[0].is_compaction_summary());
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_emergency_truncation() {
        let mut session = session_with(50, 2_000);
        let cfg = CompactionConfig::default();
        let provider = ScriptedProvider::always_error();
        let outcome = maybe_compact(&mut session, &cfg, 128_000, "gpt-4o", None, &provider)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.strategy_used, CompactionStrategyUsed::Emergency);
        assert!(session.messages()[0]
            .content
            .contains("emergency-compacted"));
    }

    #[tokio::test]
    async fn recompacting_an_already_compacted_session_under_threshold_is_a_no_op() {
        let mut session = session_with(50, 2_000);
        let mut cfg = CompactionConfig::default();
        cfg.keep_last_messages = 10;
        let provider = ScriptedProvider::always_text("summary");
        maybe_compact(&mut session, &cfg, 128_000, "gpt-4o", None, &provider)
            .await
            .unwrap();
        let len_after_first = session.len();
        let outcome = maybe_compact(&mut session, &cfg, 128_000, "gpt-4o", None, &provider)
            .await
            .unwrap();
        assert!(outcome.is_none(), "a freshly compacted session should be under threshold");
        assert_eq!(session.len(), len_after_first);
    }

    #[tokio::test]
    async fn disabled_compaction_never_runs() {
        let mut session = session_with(50, 2_000);
        let mut cfg = CompactionConfig::default();
        cfg.enabled = false;
        let provider = ScriptedProvider::always_text("summary");
        let outcome = maybe_compact(&mut session, &cfg, 128_000, "gpt-4o", None, &provider)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(session.len(), 50);
    }
}
