// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic, network-free `ModelProvider`s: an echo provider for local
//! smoke-testing and a scripted provider for exact-sequence tests. A real
//! wire driver (OpenAI/Anthropic/etc.) is an external collaborator (§6).

use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{ModelProvider, ProviderError};
use crate::types::{CompletionRequest, CompletionResponse, Role, Usage};

/// Echoes the most recent user message back as the assistant's reply.
/// Never requests a tool call, so a turn against it always finalizes on the
/// first iteration — useful for exercising the pipeline without a real
/// backend wired up.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let reply = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        Ok(CompletionResponse {
            content: format!("echo: {reply}"),
            tool_calls: Vec::new(),
            finish_reason: "stop".into(),
            usage: Usage::default(),
            provider_fields: serde_json::Map::new(),
        })
    }

    fn supported_models(&self) -> Vec<String> {
        vec!["echo".into()]
    }
}

/// A provider that replays a fixed queue of full request/response pairs,
/// repeating the final entry once exhausted. Distinct from
/// `agentcore_core::testing::ScriptedProvider`, which only this crate's
/// own dependents use, so `agentcore-model` has no back-reference to
/// `agentcore-core`.
pub struct RepeatingProvider {
    replies: Mutex<Vec<String>>,
}

impl RepeatingProvider {
    pub fn new(replies: Vec<String>) -> Self {
        Self { replies: Mutex::new(replies) }
    }
}

#[async_trait]
impl ModelProvider for RepeatingProvider {
    async fn chat(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let mut replies = self.replies.lock().unwrap();
        let content = if replies.len() > 1 {
            replies.remove(0)
        } else {
            replies.first().cloned().unwrap_or_default()
        };
        Ok(CompletionResponse {
            content,
            tool_calls: Vec::new(),
            finish_reason: "stop".into(),
            usage: Usage::default(),
            provider_fields: serde_json::Map::new(),
        })
    }
}
