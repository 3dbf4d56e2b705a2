// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! RequestViewBuilder (C2): project the canonical log into the provider-facing
//! `Vec<agentcore_model::Message>` for exactly one LLM call. Never writes
//! back — `Session`/`TurnContext.messages` stay the source of truth.
//!
//! Three concerns live here, in order: (1) tool-call id remap for ids that
//! violate a provider's wire format, kept stable for the registry's lifetime
//! so repeated builds agree (R1); (2) incompatibility masking, flattening
//! structured tool messages into plain text for providers that don't accept
//! them; (3) emergency per-message truncation, a last-resort, view-only cap
//! distinct from `Compactor`'s preventive history trimming.

use std::collections::HashMap;

use uuid::Uuid;

use agentcore_model::{FunctionCall, Message as WireMessage, MessageContent, ToolCallPart};

use crate::message::{Message, Role};

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MAX_NATIVE_ID_LEN: usize = 40;
const MIN_EMERGENCY_BUDGET_CHARS: usize = 10_000;
/// Preview length for a tool result folded into flattened masking text —
/// distinct from `ToolExecutor`'s `maxToolResultChars` cap, which bounds what
/// reaches the log in the first place.
const MASKED_RESULT_PREVIEW_CHARS: usize = 400;
const PROVIDER_SWITCH_REASON: &str = "provider_switch";

fn base36_fixed_width(mut n: u128, width: usize) -> String {
    let mut out = vec![0u8; width];
    for slot in out.iter_mut().rev() {
        *slot = BASE36_ALPHABET[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8(out).expect("base36 alphabet is ASCII")
}

fn generate_call_id() -> String {
    format!("call_{}", base36_fixed_width(Uuid::new_v4().as_u128(), 24))
}

fn id_needs_remap(id: &str) -> bool {
    id.is_empty() || id.len() > MAX_NATIVE_ID_LEN || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub(crate) fn sanitize_function_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Stable `rawId -> viewId` remap table, scoped to one pipeline instance's
/// lifetime (not per-turn) so the same raw id always yields the same view id
/// across repeated builds (R1).
#[derive(Debug, Default)]
pub struct RemapRegistry {
    forward: HashMap<String, String>,
}

impl RemapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the view id for `raw_id`, remapping and caching it the first
    /// time an invalid id is seen. Valid ids pass through unchanged.
    fn view_id_for(&mut self, raw_id: &str) -> String {
        if let Some(existing) = self.forward.get(raw_id) {
            return existing.clone();
        }
        let view_id = if id_needs_remap(raw_id) {
            generate_call_id()
        } else {
            raw_id.to_string()
        };
        self.forward.insert(raw_id.to_string(), view_id.clone());
        view_id
    }
}

/// Capability gate this module needs for masking: whether the target model
/// provider accepts structured tool-call / tool-result messages at all.
/// Conservative default mirrors `router::conservative_default`'s "unknown"
/// provider — treated as incapable until proven otherwise.
#[derive(Debug, Clone)]
pub struct ProviderKey {
    pub provider: String,
    pub supports_tool_messages: bool,
}

impl ProviderKey {
    pub fn for_provider(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        let supports_tool_messages = matches!(provider.as_str(), "openai" | "anthropic" | "google");
        Self {
            provider,
            supports_tool_messages,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestViewError {
    #[error("tool result {0} has no preceding assistant tool call in this view")]
    OrphanedToolResult(String),
}

#[derive(Debug, Clone, Default)]
pub struct ViewDiagnostics {
    pub remapped_ids: Vec<(String, String)>,
    /// Number of assistant-tool-call/tool-result pairs collapsed into one
    /// plain-text assistant message for an incapable provider (§4.6 item 3).
    pub flattened_count: usize,
    /// Set alongside `flattened_count` whenever masking occurs; always
    /// `"provider_switch"` in this design, there being only one trigger.
    pub masking_reason: Option<String>,
    pub truncated_messages: usize,
}

fn emergency_budget_chars(model_max_input_tokens: u32, chars_per_token: f32) -> usize {
    let scaled = (model_max_input_tokens as f32 * chars_per_token * 0.25) as usize;
    scaled.max(MIN_EMERGENCY_BUDGET_CHARS)
}

/// Mirrors `executor::truncate_for_limit`'s shrink-to-fit loop: the notice's
/// own digits grow with `total`/`kept`, so the budget is only exact if the
/// notice length is measured after the numbers are known, not estimated from
/// a single-digit template.
fn truncate_text_if_needed(text: &str, budget: usize) -> Option<String> {
    let total = text.chars().count();
    if total <= budget {
        return None;
    }

    let mut kept = budget;
    loop {
        let notice = format!("\n[EMERGENCY TRUNCATED: {total} chars total, kept first {kept} chars to fit the context budget]");
        let notice_len = notice.chars().count();
        if kept + notice_len <= budget || kept == 0 {
            let head: String = text.chars().take(kept).collect();
            return Some(format!("{head}{notice}"));
        }
        kept -= 1;
    }
}

/// Shortens a tool result folded into flattened masking text; independent of
/// `apply_emergency_truncation`'s per-message budget, which still runs on the
/// flattened message afterwards.
fn truncate_for_display(text: &str) -> String {
    let total = text.chars().count();
    if total <= MASKED_RESULT_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MASKED_RESULT_PREVIEW_CHARS).collect();
    format!("{head}… [{total} chars total]")
}

/// Flattens one assistant tool-call message together with its paired
/// tool-result messages into a single plain-text assistant message, per
/// spec §4.6 item 3: `"Called <name>(<args>) → <truncated-result>"` per call,
/// joined by newlines when the turn made more than one call. Returns the
/// flattened wire message and how many raw messages it consumed — the
/// assistant message itself plus each paired tool-result found immediately
/// after it, in order.
fn flatten_tool_call_turn(raw: &[Message], start: usize, diagnostics: &mut ViewDiagnostics) -> (WireMessage, usize) {
    let assistant = &raw[start];
    let mut consumed = 1;
    let mut lines = Vec::with_capacity(assistant.tool_calls.len());

    for tc in &assistant.tool_calls {
        let paired = raw
            .get(start + consumed)
            .filter(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(tc.id.as_str()));
        let result_text = match paired {
            Some(result_msg) => {
                consumed += 1;
                truncate_for_display(&result_msg.content)
            }
            None => "(no result)".to_string(),
        };
        lines.push(format!("Called {}({}) → {result_text}", tc.name, tc.raw_arguments));
        diagnostics.flattened_count += 1;
    }
    diagnostics.masking_reason = Some(PROVIDER_SWITCH_REASON.into());

    let body = lines.join("\n");
    let text = if assistant.content.is_empty() {
        body
    } else {
        format!("{}\n{body}", assistant.content)
    };
    (WireMessage::assistant(text), consumed)
}

/// Project the canonical log into one provider-facing request view. Pure
/// over its inputs and the registry's accumulated state.
pub fn build_view(
    raw: &[Message],
    registry: &mut RemapRegistry,
    provider: &ProviderKey,
    model_max_input_tokens: u32,
    chars_per_token: f32,
) -> Result<(Vec<WireMessage>, ViewDiagnostics), RequestViewError> {
    let mut diagnostics = ViewDiagnostics::default();
    let budget = emergency_budget_chars(model_max_input_tokens, chars_per_token);
    let mut view = Vec::with_capacity(raw.len());

    let mut i = 0;
    while i < raw.len() {
        let m = &raw[i];

        // An incapable provider flattens a tool-call turn and its paired
        // results into one message, consuming more than one raw entry at a
        // time — handled separately from the one-to-one cases below.
        if m.role == Role::Assistant && !m.tool_calls.is_empty() && !provider.supports_tool_messages {
            let (mut wire, consumed) = flatten_tool_call_turn(raw, i, &mut diagnostics);
            apply_emergency_truncation(&mut wire, budget, &mut diagnostics);
            view.push(wire);
            i += consumed;
            continue;
        }

        let mut wire = match m.role {
            Role::System => WireMessage::system(m.content.clone()),
            Role::User => WireMessage::user(m.content.clone()),
            Role::Assistant if m.tool_calls.is_empty() => WireMessage::assistant(m.content.clone()),
            Role::Assistant => {
                let calls: Vec<ToolCallPart> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        let view_id = registry.view_id_for(&tc.id);
                        if view_id != tc.id {
                            diagnostics.remapped_ids.push((tc.id.clone(), view_id.clone()));
                        }
                        ToolCallPart {
                            id: view_id,
                            function: FunctionCall {
                                name: sanitize_function_name(&tc.name),
                                arguments: tc.raw_arguments.clone(),
                            },
                        }
                    })
                    .collect();
                WireMessage::assistant_tool_calls(m.content.clone(), calls)
            }
            Role::Tool => {
                let raw_id = m.tool_call_id.clone().unwrap_or_default();
                if raw_id.is_empty() {
                    return Err(RequestViewError::OrphanedToolResult("<missing>".into()));
                }
                let tool_name = m.tool_name.clone().unwrap_or_else(|| "unknown".to_string());
                if provider.supports_tool_messages {
                    let view_id = registry.view_id_for(&raw_id);
                    WireMessage::tool_result(view_id, sanitize_function_name(&tool_name), m.content.clone())
                } else {
                    // A tool-result with no preceding assistant tool-call message
                    // in this view (e.g. the pairing assistant message scrolled
                    // out of `keepLast`) — mask it standalone rather than drop it.
                    diagnostics.flattened_count += 1;
                    diagnostics.masking_reason = Some(PROVIDER_SWITCH_REASON.into());
                    WireMessage::user(format!("Called {tool_name}(...) → {}", truncate_for_display(&m.content)))
                }
            }
        };

        apply_emergency_truncation(&mut wire, budget, &mut diagnostics);
        view.push(wire);
        i += 1;
    }

    Ok((view, diagnostics))
}

fn apply_emergency_truncation(wire: &mut WireMessage, budget: usize, diagnostics: &mut ViewDiagnostics) {
    match &mut wire.content {
        MessageContent::Text(text) => {
            if let Some(truncated) = truncate_text_if_needed(text, budget) {
                *text = truncated;
                diagnostics.truncated_messages += 1;
            }
        }
        MessageContent::ToolCalls { text, .. } => {
            if let Some(truncated) = truncate_text_if_needed(text, budget) {
                *text = truncated;
                diagnostics.truncated_messages += 1;
            }
        }
        MessageContent::ToolResult { content, .. } => {
            if let agentcore_model::ToolResultContent::Text(text) = content {
                if let Some(truncated) = truncate_text_if_needed(text, budget) {
                    *text = truncated;
                    diagnostics.truncated_messages += 1;
                }
            }
        }
        MessageContent::ContentParts(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    fn openai() -> ProviderKey {
        ProviderKey::for_provider("openai")
    }

    #[test]
    fn plain_text_messages_pass_through_unchanged() {
        let raw = vec![Message::user("hello"), Message::assistant("hi there")];
        let mut registry = RemapRegistry::new();
        let (view, diag) = build_view(&raw, &mut registry, &openai(), 128_000, 3.5).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].as_text(), Some("hello"));
        assert_eq!(diag.remapped_ids.len(), 0);
    }

    #[test]
    fn valid_short_tool_call_id_is_not_remapped() {
        let raw = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_abc123", "search", serde_json::json!({}))],
        )];
        let mut registry = RemapRegistry::new();
        let (view, diag) = build_view(&raw, &mut registry, &openai(), 128_000, 3.5).unwrap();
        match &view[0].content {
            MessageContent::ToolCalls { calls, .. } => assert_eq!(calls[0].id, "call_abc123"),
            _ => panic!("expected tool calls"),
        }
        assert!(diag.remapped_ids.is_empty());
    }

    #[test]
    fn overlong_tool_call_id_is_remapped_consistently_for_call_and_result() {
        let long_id = "x".repeat(41);
        let raw = vec![
            Message::assistant_with_tool_calls("", vec![ToolCall::new(long_id.clone(), "search", serde_json::json!({}))]),
            Message::tool_result(long_id.clone(), "search", "ok"),
        ];
        let mut registry = RemapRegistry::new();
        let (view, diag) = build_view(&raw, &mut registry, &openai(), 128_000, 3.5).unwrap();
        let call_id = match &view[0].content {
            MessageContent::ToolCalls { calls, .. } => calls[0].id.clone(),
            _ => panic!("expected tool calls"),
        };
        let result_id = match &view[1].content {
            MessageContent::ToolResult { tool_call_id, .. } => tool_call_id.clone(),
            _ => panic!("expected tool result"),
        };
        assert_eq!(call_id, result_id);
        assert!(call_id.len() <= MAX_NATIVE_ID_LEN);
        assert_eq!(diag.remapped_ids.len(), 1);
    }

    #[test]
    fn illegal_charset_id_is_remapped_even_under_length_cap() {
        let raw = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call with spaces!", "search", serde_json::json!({}))],
        )];
        let mut registry = RemapRegistry::new();
        let (view, _diag) = build_view(&raw, &mut registry, &openai(), 128_000, 3.5).unwrap();
        match &view[0].content {
            MessageContent::ToolCalls { calls, .. } => assert_ne!(calls[0].id, "call with spaces!"),
            _ => panic!("expected tool calls"),
        }
    }

    #[test]
    fn rebuilding_the_view_with_the_same_registry_remaps_identically() {
        let long_id = "y".repeat(50);
        let raw = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(long_id.clone(), "search", serde_json::json!({}))],
        )];
        let mut registry = RemapRegistry::new();
        let (first, _) = build_view(&raw, &mut registry, &openai(), 128_000, 3.5).unwrap();
        let (second, _) = build_view(&raw, &mut registry, &openai(), 128_000, 3.5).unwrap();
        let id_of = |m: &WireMessage| match &m.content {
            MessageContent::ToolCalls { calls, .. } => calls[0].id.clone(),
            _ => panic!("expected tool calls"),
        };
        assert_eq!(id_of(&first[0]), id_of(&second[0]));
    }

    #[test]
    fn incapable_provider_flattens_a_tool_call_and_its_result_into_one_message() {
        let raw = vec![
            Message::assistant_with_tool_calls("checking", vec![ToolCall::new("c1", "search", serde_json::json!({"q":"x"}))]),
            Message::tool_result("c1", "search", "found it"),
        ];
        let mut registry = RemapRegistry::new();
        let unknown = ProviderKey::for_provider("some-niche-vendor");
        let (view, diag) = build_view(&raw, &mut registry, &unknown, 128_000, 3.5).unwrap();
        assert_eq!(view.len(), 1, "the tool-call/tool-result pair collapses into one message");
        assert!(matches!(view[0].content, MessageContent::Text(_)));
        let text = view[0].as_text().unwrap();
        assert!(text.starts_with("Called search("));
        assert!(text.contains("found it"));
        assert_eq!(diag.flattened_count, 1);
        assert_eq!(diag.masking_reason.as_deref(), Some("provider_switch"));
    }

    #[test]
    fn incapable_provider_flattens_every_call_in_a_multi_call_turn() {
        let raw = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCall::new("c1", "search", serde_json::json!({"q": "x"})),
                    ToolCall::new("c2", "search", serde_json::json!({"q": "y"})),
                ],
            ),
            Message::tool_result("c1", "search", "result x"),
            Message::tool_result("c2", "search", "result y"),
        ];
        let mut registry = RemapRegistry::new();
        let unknown = ProviderKey::for_provider("some-niche-vendor");
        let (view, diag) = build_view(&raw, &mut registry, &unknown, 128_000, 3.5).unwrap();
        assert_eq!(view.len(), 1, "one assistant turn, however many calls, flattens to one message");
        let text = view[0].as_text().unwrap();
        assert!(text.contains("result x"));
        assert!(text.contains("result y"));
        assert_eq!(diag.flattened_count, 2);
    }

    #[test]
    fn a_long_tool_result_is_previewed_rather_than_inlined_whole_when_flattened() {
        let long_result = "r".repeat(10_000);
        let raw = vec![
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "search", serde_json::json!({}))]),
            Message::tool_result("c1", "search", long_result.clone()),
        ];
        let mut registry = RemapRegistry::new();
        let unknown = ProviderKey::for_provider("some-niche-vendor");
        let (view, _diag) = build_view(&raw, &mut registry, &unknown, 128_000, 3.5).unwrap();
        let text = view[0].as_text().unwrap();
        assert!(text.len() < long_result.len());
        assert!(text.contains("chars total"));
    }

    #[test]
    fn function_name_with_illegal_characters_is_sanitized() {
        assert_eq!(sanitize_function_name("weather.get!"), "weather_get_");
        assert_eq!(sanitize_function_name(""), "unknown");
    }

    #[test]
    fn oversized_single_message_is_truncated_with_notice() {
        let huge = "z".repeat(200_000);
        let raw = vec![Message::user(huge)];
        let mut registry = RemapRegistry::new();
        let (view, diag) = build_view(&raw, &mut registry, &openai(), 1_000, 3.5).unwrap();
        let text = view[0].as_text().unwrap();
        assert!(text.contains("EMERGENCY TRUNCATED"));
        assert_eq!(diag.truncated_messages, 1);
    }

    #[test]
    fn small_messages_are_never_truncated_even_under_a_tiny_budget() {
        let raw = vec![Message::user("short")];
        let mut registry = RemapRegistry::new();
        let (view, diag) = build_view(&raw, &mut registry, &openai(), 1, 3.5).unwrap();
        assert_eq!(view[0].as_text(), Some("short"));
        assert_eq!(diag.truncated_messages, 0);
    }
}
