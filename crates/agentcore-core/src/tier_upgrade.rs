// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! TierUpgradePolicy (C4): scan recent turn events and recommend an upgrade
//! to the `coding` tier. Pure function over the slice of messages appended
//! since the last user message — `ToolLoop` calls it after each tool batch.

use crate::context::Tier;
use crate::message::{Message, Role};

const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".java", ".go", ".rs", ".rb", ".sh", ".c", ".cpp", ".cs", ".kt", ".scala",
    ".swift", ".lua", ".r", ".pl", ".php", ".sql", ".yaml", ".yml", ".toml", ".gradle", ".cmake",
    ".makefile",
];
const CODE_BASENAMES: &[&str] = &["Makefile", "Dockerfile"];

const FILE_TOOL_NAMES: &[&str] = &["filesystem.write_file", "filesystem.read_file"];

const TOOLCHAIN_COMMANDS: &[&str] = &[
    "python", "node", "npm", "npx", "pip", "mvn", "gradle", "gcc", "g++", "cargo", "go", "rustc",
    "pytest", "make", "cmake", "javac", "dotnet", "ruby", "tsc", "webpack", "esbuild", "jest",
    "mocha", "yarn",
];

const STACK_TRACE_MARKERS: &[&str] = &[
    "Traceback",
    "SyntaxError",
    "NullPointerException",
    "at com.",
    "at org.",
    "panic:",
    "error[E",
];

fn path_looks_like_code(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);
    if CODE_BASENAMES.contains(&basename) {
        return true;
    }
    let lower = path.to_lowercase();
    CODE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn signal_from_file_tool_call(name: &str, arguments: &serde_json::Value) -> bool {
    if !FILE_TOOL_NAMES.contains(&name) {
        return false;
    }
    arguments
        .get("path")
        .and_then(|v| v.as_str())
        .map(path_looks_like_code)
        .unwrap_or(false)
}

fn signal_from_shell_call(name: &str, arguments: &serde_json::Value) -> bool {
    if name != "shell" {
        return false;
    }
    let command = arguments
        .get("shell_command")
        .or_else(|| arguments.get("command"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let first_token = command.split_whitespace().next().unwrap_or("");
    TOOLCHAIN_COMMANDS.contains(&first_token)
}

fn signal_from_tool_result(content: &str) -> bool {
    STACK_TRACE_MARKERS.iter().any(|marker| content.contains(marker))
}

/// True if any of the three signal families fires within `messages` (the
/// slice appended since the last user message this turn).
pub fn scan_for_upgrade_signals(messages: &[Message]) -> bool {
    for m in messages {
        if m.role == Role::Assistant {
            for tc in &m.tool_calls {
                if signal_from_file_tool_call(&tc.name, &tc.arguments) || signal_from_shell_call(&tc.name, &tc.arguments) {
                    return true;
                }
            }
        }
        if m.role == Role::Tool && signal_from_tool_result(&m.content) {
            return true;
        }
    }
    false
}

/// Applies the policy: upgrade to `coding` when a signal fires and the
/// current tier isn't already ≥ coding capability and the preference isn't
/// force-locked. Never downgrades — enforced by `Tier::is_upgrade_from`.
pub fn recommended_tier(current: Tier, force_locked: bool, messages_since_last_user: &[Message]) -> Option<Tier> {
    if force_locked {
        return None;
    }
    if matches!(current, Tier::Coding | Tier::Deep) {
        return None;
    }
    if scan_for_upgrade_signals(messages_since_last_user) {
        Some(Tier::Coding)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    #[test]
    fn no_signal_on_plain_text_exchange() {
        let messages = vec![Message::assistant("hello there")];
        assert!(!scan_for_upgrade_signals(&messages));
    }

    #[test]
    fn write_file_with_code_extension_is_a_signal() {
        let messages = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(
                "c1",
                "filesystem.write_file",
                serde_json::json!({"path": "app.py", "content": "print('x')"}),
            )],
        )];
        assert!(scan_for_upgrade_signals(&messages));
    }

    #[test]
    fn write_file_with_non_code_extension_is_not_a_signal() {
        let messages = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(
                "c1",
                "filesystem.write_file",
                serde_json::json!({"path": "notes.txt"}),
            )],
        )];
        assert!(!scan_for_upgrade_signals(&messages));
    }

    #[test]
    fn shell_toolchain_command_is_a_signal() {
        let messages = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("c1", "shell", serde_json::json!({"shell_command": "cargo build"}))],
        )];
        assert!(scan_for_upgrade_signals(&messages));
    }

    #[test]
    fn shell_non_toolchain_command_is_not_a_signal() {
        let messages = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("c1", "shell", serde_json::json!({"shell_command": "ls -la"}))],
        )];
        assert!(!scan_for_upgrade_signals(&messages));
    }

    #[test]
    fn stack_trace_marker_in_tool_result_is_a_signal() {
        let messages = vec![Message::tool_result("c1", "shell", "Traceback (most recent call last):")];
        assert!(scan_for_upgrade_signals(&messages));
    }

    #[test]
    fn recommended_tier_is_none_when_force_locked() {
        let signal_messages = vec![Message::tool_result("c1", "shell", "panic: boom")];
        assert!(recommended_tier(Tier::Balanced, true, &signal_messages).is_none());
    }

    #[test]
    fn recommended_tier_is_none_when_already_coding_or_deep() {
        let signal_messages = vec![Message::tool_result("c1", "shell", "panic: boom")];
        assert!(recommended_tier(Tier::Coding, false, &signal_messages).is_none());
        assert!(recommended_tier(Tier::Deep, false, &signal_messages).is_none());
    }

    #[test]
    fn recommended_tier_upgrades_to_coding_on_signal() {
        let signal_messages = vec![Message::tool_result("c1", "shell", "panic: boom")];
        assert_eq!(recommended_tier(Tier::Balanced, false, &signal_messages), Some(Tier::Coding));
    }

    #[test]
    fn dockerfile_basename_without_extension_is_a_signal() {
        let messages = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(
                "c1",
                "filesystem.write_file",
                serde_json::json!({"path": "docker/Dockerfile"}),
            )],
        )];
        assert!(scan_for_upgrade_signals(&messages));
    }
}
