// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A single trivial tool used to exercise the tool-loop in tests and the demo
//! binary. Concrete tool semantics beyond this are out of scope — real
//! deployments register their own [`crate::Tool`] implementations.
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

/// Echoes back its `text` argument. Useful as a no-risk default registration
/// and as the scripted tool target in end-to-end tests.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the given text. Useful for testing the tool-calling loop."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            },
            "required": ["text"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let text = call
            .args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        ToolOutput::ok(&call.id, text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_given_text() {
        let call = ToolCall {
            id: "1".into(),
            name: "echo".into(),
            args: json!({"text": "hello"}),
        };
        let out = EchoTool.execute(&call).await;
        assert_eq!(out.content, "hello");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn echo_missing_text_yields_empty_string() {
        let call = ToolCall {
            id: "1".into(),
            name: "echo".into(),
            args: json!({}),
        };
        let out = EchoTool.execute(&call).await;
        assert_eq!(out.content, "");
    }
}
