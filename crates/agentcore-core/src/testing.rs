// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted and in-memory test doubles for the ports this crate consumes.
//!
//! Kept public (not `#[cfg(test)]`-gated) so both this crate's inline tests
//! and the `tests/scenarios.rs` integration suite can share them, mirroring
//! the teacher's `ScriptedMockProvider` living in its wire-types crate
//! rather than being duplicated per test file.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use agentcore_model::{CompletionRequest, CompletionResponse, ModelProvider, ProviderError, ToolCallPart, Usage};

use crate::message::{Message, Session, SessionError};
use crate::ports::{ChannelError, ChannelPort, ConfirmationOutcome, SessionStore};

/// One scripted model turn.
pub enum ScriptedTurn {
    Text(String),
    ToolCalls(Vec<(String, String, String)>),
    Error,
}

/// A `ModelProvider` that replays a fixed script of responses, one per
/// `chat` call, repeating the final entry once the script is exhausted.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedTurn>>,
    repeat_last: Mutex<Option<ScriptedResponseKind>>,
}

#[derive(Clone)]
enum ScriptedResponseKind {
    Text(String),
    Error,
}

impl ScriptedProvider {
    pub fn from_turns(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into_iter().collect()),
            repeat_last: Mutex::new(None),
        }
    }

    pub fn always_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat_last: Mutex::new(Some(ScriptedResponseKind::Text(text))),
        }
    }

    pub fn always_error() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat_last: Mutex::new(Some(ScriptedResponseKind::Error)),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let next = self.script.lock().unwrap().pop_front();
        let turn = match next {
            Some(t) => t,
            None => match self.repeat_last.lock().unwrap().clone() {
                Some(ScriptedResponseKind::Text(t)) => ScriptedTurn::Text(t),
                Some(ScriptedResponseKind::Error) => ScriptedTurn::Error,
                None => ScriptedTurn::Text(String::new()),
            },
        };
        match turn {
            ScriptedTurn::Text(content) => Ok(CompletionResponse {
                content,
                tool_calls: vec![],
                finish_reason: "stop".into(),
                usage: Usage::default(),
                provider_fields: serde_json::Map::new(),
            }),
            ScriptedTurn::ToolCalls(calls) => Ok(CompletionResponse {
                content: String::new(),
                tool_calls: calls
                    .into_iter()
                    .map(|(id, name, arguments)| ToolCallPart {
                        id,
                        function: agentcore_model::FunctionCall { name, arguments },
                    })
                    .collect(),
                finish_reason: "tool_calls".into(),
                usage: Usage::default(),
                provider_fields: serde_json::Map::new(),
            }),
            ScriptedTurn::Error => Err(ProviderError::Request("scripted failure".into())),
        }
    }
}

/// A `SessionStore` backed by an in-process map, for tests only.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, session: Session) {
        self.sessions.lock().unwrap().insert(session.conversation_key.clone(), session);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, conversation_key: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(conversation_key).cloned()
    }

    async fn append(&self, conversation_key: &str, messages: Vec<Message>) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(conversation_key.to_string())
            .or_insert_with(|| Session::new(conversation_key));
        session.push_many(messages);
    }

    async fn replace_prefix(
        &self,
        conversation_key: &str,
        prefix_len: usize,
        summary: Message,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(conversation_key.to_string())
            .or_insert_with(|| Session::new(conversation_key));
        session.replace_prefix(prefix_len, summary)
    }

    async fn list_recent(&self, conversation_key: &str, limit: usize) -> Vec<Message> {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(conversation_key) {
            Some(s) => {
                let msgs = s.messages();
                let start = msgs.len().saturating_sub(limit);
                msgs[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

/// A `ChannelPort` that records every send for assertions and always
/// approves confirmations, unless constructed with `deny_confirmations`.
pub struct RecordingChannelPort {
    pub sent_text: Mutex<Vec<(String, String)>>,
    pub sent_attachments: Mutex<Vec<(String, String)>>,
    deny_confirmations: bool,
}

impl RecordingChannelPort {
    pub fn new() -> Self {
        Self {
            sent_text: Mutex::new(Vec::new()),
            sent_attachments: Mutex::new(Vec::new()),
            deny_confirmations: false,
        }
    }

    pub fn denying_confirmations() -> Self {
        Self {
            sent_text: Mutex::new(Vec::new()),
            sent_attachments: Mutex::new(Vec::new()),
            deny_confirmations: true,
        }
    }
}

impl Default for RecordingChannelPort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelPort for RecordingChannelPort {
    async fn send_text(&self, chat_id: &str, content: &str) -> Result<(), ChannelError> {
        self.sent_text.lock().unwrap().push((chat_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn send_attachment(
        &self,
        chat_id: &str,
        _bytes: &[u8],
        filename: &str,
        _caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.sent_attachments
            .lock()
            .unwrap()
            .push((chat_id.to_string(), filename.to_string()));
        Ok(())
    }

    async fn show_typing(&self, _chat_id: &str) {}

    async fn request_confirmation(&self, _chat_id: &str, _prompt: &str, _timeout: Duration) -> ConfirmationOutcome {
        if self.deny_confirmations {
            ConfirmationOutcome::Denied
        } else {
            ConfirmationOutcome::Approved
        }
    }
}
