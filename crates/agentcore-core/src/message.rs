// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical conversation log: `Message`, `ToolCall`, `Session`.
//!
//! These types are distinct from `agentcore_model`'s wire-facing `Message` —
//! this is the append-only raw history a `Session` owns; `RequestViewBuilder`
//! projects it into a provider view right before one LLM call and never
//! writes the projection back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One tool call requested by the assistant, as recorded in the raw log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Vendor-assigned identifier. May exceed the 40-char/charset limit a
    /// provider's wire format requires — `RequestViewBuilder` remaps it for
    /// the view, the raw log always keeps the original.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
    /// Source argument string exactly as the provider sent it, kept for
    /// round-tripping malformed-but-repaired JSON.
    pub raw_arguments: String,
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let raw_arguments = arguments.to_string();
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            raw_arguments,
            extensions: Map::new(),
        }
    }
}

/// A single entry in a session's canonical log. Never destructively mutated
/// except by `Compactor` through `Session::replace_prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// May be empty for a pure tool-call assistant message.
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Populated only when `role == Assistant`.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Populated only when `role == Tool`.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Open mapping. Recognized keys: `sanitized.original`,
    /// `sanitized.threats`, `compacted.summary` (bool), `attachments`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Opaque vendor fields that must survive persistence and round-trip
    /// (reasoning traces, native tool-call ids/indices).
    #[serde(default)]
    pub provider_fields: Map<String, Value>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            metadata: Map::new(),
            provider_fields: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut m = Self::new(Role::Assistant, content);
        m.tool_calls = tool_calls;
        m
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::new(Role::Tool, content);
        m.tool_call_id = Some(tool_call_id.into());
        m.tool_name = Some(tool_name.into());
        m
    }

    pub fn is_compaction_summary(&self) -> bool {
        matches!(self.metadata.get("compacted.summary"), Some(Value::Bool(true)))
    }

    pub fn mark_as_compaction_summary(mut self) -> Self {
        self.metadata.insert("compacted.summary".into(), Value::Bool(true));
        self
    }
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Per-conversation metadata the session carries alongside the raw log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub active_skill: Option<String>,
    pub last_model: Option<String>,
    pub pipeline_depth: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("prefix length {prefix_len} exceeds session length {len}")]
    PrefixOutOfBounds { prefix_len: usize, len: usize },
}

/// A conversation's append-only raw history, identified by `conversationKey`.
///
/// Invariants enforced by construction:
/// - (I1) every tool-role `Message.tool_call_id` equals the `id` of some
///   preceding assistant `ToolCall` in the same session.
/// - (I2) message order is append-only except during compaction.
/// - (I3) compaction replaces a contiguous prefix with at most one synthetic
///   system message marked `compacted.summary=true`.
#[derive(Debug, Clone)]
pub struct Session {
    pub conversation_key: String,
    messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(conversation_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_key: conversation_key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: SessionMetadata::default(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append-only. The only way new entries enter the raw log outside of
    /// compaction.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    pub fn push_many(&mut self, messages: impl IntoIterator<Item = Message>) {
        for m in messages {
            self.push(m);
        }
    }

    /// The single destructive-edit entry point (I3): replace the first
    /// `prefix_len` messages with one synthetic summary message. Used only by
    /// `Compactor`.
    pub fn replace_prefix(&mut self, prefix_len: usize, summary: Message) -> Result<(), SessionError> {
        if prefix_len > self.messages.len() {
            return Err(SessionError::PrefixOutOfBounds {
                prefix_len,
                len: self.messages.len(),
            });
        }
        let mut rest = self.messages.split_off(prefix_len);
        self.messages.clear();
        self.messages.push(summary);
        self.messages.append(&mut rest);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Index of the most recent user message, if any.
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// Messages appended after the most recent user message (used by
    /// `TierUpgradePolicy`, which only scans the current turn's activity).
    pub fn messages_since_last_user(&self) -> &[Message] {
        match self.last_user_index() {
            Some(idx) => &self.messages[idx + 1..],
            None => &self.messages[..],
        }
    }

    /// Verifies invariant (I1): every tool-role message's `tool_call_id`
    /// matches a preceding assistant `ToolCall.id`.
    pub fn verify_closure(&self) -> bool {
        let mut seen_calls: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for m in &self.messages {
            match m.role {
                Role::Assistant => {
                    for tc in &m.tool_calls {
                        seen_calls.insert(tc.id.as_str());
                    }
                }
                Role::Tool => {
                    let Some(id) = m.tool_call_id.as_deref() else {
                        return false;
                    };
                    if !seen_calls.contains(id) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_push_is_append_only() {
        let mut s = Session::new("conv-1");
        s.push(Message::user("hi"));
        s.push(Message::assistant("hello"));
        assert_eq!(s.len(), 2);
        assert_eq!(s.messages()[0].content, "hi");
    }

    #[test]
    fn replace_prefix_collapses_a_contiguous_prefix() {
        let mut s = Session::new("conv-1");
        s.push(Message::user("a"));
        s.push(Message::assistant("b"));
        s.push(Message::user("c"));
        let summary = Message::system("summary").mark_as_compaction_summary();
        s.replace_prefix(2, summary).unwrap();
        assert_eq!(s.len(), 2);
        assert!(s.messages()[0].is_compaction_summary());
        assert_eq!(s.messages()[1].content, "c");
    }

    #[test]
    fn replace_prefix_rejects_out_of_bounds() {
        let mut s = Session::new("conv-1");
        s.push(Message::user("a"));
        let err = s.replace_prefix(5, Message::system("x")).unwrap_err();
        assert!(matches!(err, SessionError::PrefixOutOfBounds { .. }));
    }

    #[test]
    fn verify_closure_true_when_every_tool_call_answered() {
        let mut s = Session::new("conv-1");
        s.push(Message::user("do it"));
        s.push(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "search", serde_json::json!({}))],
        ));
        s.push(Message::tool_result("call_1", "search", "ok"));
        assert!(s.verify_closure());
    }

    #[test]
    fn verify_closure_false_when_tool_result_has_no_matching_call() {
        let mut s = Session::new("conv-1");
        s.push(Message::tool_result("call_missing", "search", "ok"));
        assert!(!s.verify_closure());
    }

    #[test]
    fn messages_since_last_user_excludes_earlier_turns() {
        let mut s = Session::new("conv-1");
        s.push(Message::user("first"));
        s.push(Message::assistant("reply one"));
        s.push(Message::user("second"));
        s.push(Message::assistant("reply two"));
        let since = s.messages_since_last_user();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].content, "reply two");
    }

    #[test]
    fn messages_since_last_user_is_everything_when_no_user_message() {
        let mut s = Session::new("conv-1");
        s.push(Message::system("sys"));
        assert_eq!(s.messages_since_last_user().len(), 1);
    }

    #[test]
    fn tool_call_new_derives_raw_arguments_from_json() {
        let tc = ToolCall::new("call_1", "search", serde_json::json!({"q": "x"}));
        assert_eq!(tc.raw_arguments, r#"{"q":"x"}"#);
    }
}
