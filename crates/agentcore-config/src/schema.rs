// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub tool_loop: ToolLoopConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

// ── Router (C3 / C4) ──────────────────────────────────────────────────────────

fn default_temperature() -> f32 {
    0.7
}

/// Static per-model capability table entry, recognized configuration under
/// `llm.models.<name>`: `{provider, reasoningRequired, supportsTemperature,
/// maxInputTokens}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTableEntry {
    pub provider: String,
    #[serde(default)]
    pub reasoning_required: bool,
    #[serde(default = "default_true")]
    pub supports_temperature: bool,
    pub max_input_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "RouterConfig::default_balanced_model")]
    pub balanced_model: String,
    #[serde(default)]
    pub balanced_reasoning: Option<String>,
    #[serde(default = "RouterConfig::default_smart_model")]
    pub smart_model: String,
    #[serde(default)]
    pub smart_reasoning: Option<String>,
    #[serde(default = "RouterConfig::default_coding_model")]
    pub coding_model: String,
    #[serde(default)]
    pub coding_reasoning: Option<String>,
    #[serde(default = "RouterConfig::default_deep_model")]
    pub deep_model: String,
    #[serde(default)]
    pub deep_reasoning: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub dynamic_tier_enabled: bool,
}

impl RouterConfig {
    fn default_balanced_model() -> String {
        "gpt-4o".into()
    }
    fn default_smart_model() -> String {
        "gpt-4o".into()
    }
    fn default_coding_model() -> String {
        "claude-sonnet-4-5".into()
    }
    fn default_deep_model() -> String {
        "claude-opus-4-5".into()
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            balanced_model: Self::default_balanced_model(),
            balanced_reasoning: None,
            smart_model: Self::default_smart_model(),
            smart_reasoning: None,
            coding_model: Self::default_coding_model(),
            coding_reasoning: None,
            deep_model: Self::default_deep_model(),
            deep_reasoning: None,
            temperature: default_temperature(),
            dynamic_tier_enabled: true,
        }
    }
}

// ── Compaction (C5) ───────────────────────────────────────────────────────────

/// Strategy used when compacting the session context.
///
/// `Structured` produces a typed Markdown checkpoint with fixed sections.
/// `Narrative` uses free-form summarization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

fn default_max_context_tokens() -> u32 {
    128_000
}
fn default_keep_last_messages() -> usize {
    10
}
fn default_chars_per_token() -> f32 {
    3.5
}
fn default_system_overhead_tokens() -> u32 {
    8_000
}
fn default_max_tool_result_chars() -> usize {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_keep_last_messages")]
    pub keep_last_messages: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f32,
    #[serde(default = "default_system_overhead_tokens")]
    pub system_prompt_overhead_tokens: u32,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default)]
    pub strategy: CompactionStrategy,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_context_tokens: default_max_context_tokens(),
            keep_last_messages: default_keep_last_messages(),
            chars_per_token: default_chars_per_token(),
            system_prompt_overhead_tokens: default_system_overhead_tokens(),
            max_tool_result_chars: default_max_tool_result_chars(),
            strategy: CompactionStrategy::Structured,
        }
    }
}

// ── ToolLoop (C6 / C7) ────────────────────────────────────────────────────────

fn default_max_iterations() -> u32 {
    10
}
fn default_turn_deadline_ms() -> u64 {
    600_000
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_tool_timeout_cap_ms() -> u64 {
    300_000
}
fn default_repeat_guard_threshold() -> u32 {
    3
}
fn default_max_tool_failures() -> u32 {
    5
}
fn default_llm_request_timeout_ms() -> u64 {
    120_000
}
fn default_rate_limit_retry_base_ms() -> u64 {
    1_000
}
fn default_rate_limit_retry_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_turn_deadline_ms")]
    pub turn_deadline_ms: u64,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_tool_timeout_cap_ms")]
    pub tool_timeout_cap_ms: u64,
    /// `None` = unlimited.
    #[serde(default)]
    pub max_tool_calls_per_iteration: Option<u32>,
    #[serde(default = "default_repeat_guard_threshold")]
    pub repeat_guard_threshold: u32,
    #[serde(default = "default_max_tool_failures")]
    pub max_tool_failures: u32,
    #[serde(default)]
    pub parallel_tools: bool,
    #[serde(default = "default_llm_request_timeout_ms")]
    pub llm_request_timeout_ms: u64,
    #[serde(default = "default_rate_limit_retry_base_ms")]
    pub rate_limit_retry_base_ms: u64,
    #[serde(default = "default_rate_limit_retry_max_attempts")]
    pub rate_limit_retry_max_attempts: u32,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            turn_deadline_ms: default_turn_deadline_ms(),
            tool_timeout_ms: default_tool_timeout_ms(),
            tool_timeout_cap_ms: default_tool_timeout_cap_ms(),
            max_tool_calls_per_iteration: None,
            repeat_guard_threshold: default_repeat_guard_threshold(),
            max_tool_failures: default_max_tool_failures(),
            parallel_tools: false,
            llm_request_timeout_ms: default_llm_request_timeout_ms(),
            rate_limit_retry_base_ms: default_rate_limit_retry_base_ms(),
            rate_limit_retry_max_attempts: default_rate_limit_retry_max_attempts(),
        }
    }
}

// ── RateLimit (C1) ────────────────────────────────────────────────────────────

fn default_user_requests_per_minute() -> u32 {
    60
}
fn default_channel_messages_per_second() -> u32 {
    1
}
fn default_llm_requests_per_minute() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_user_requests_per_minute")]
    pub user_requests_per_minute: u32,
    #[serde(default = "default_channel_messages_per_second")]
    pub channel_messages_per_second: u32,
    #[serde(default = "default_llm_requests_per_minute")]
    pub llm_requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_requests_per_minute: default_user_requests_per_minute(),
            channel_messages_per_second: default_channel_messages_per_second(),
            llm_requests_per_minute: default_llm_requests_per_minute(),
        }
    }
}

// ── LLM / provider table ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub models: HashMap<String, ModelTableEntry>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_llm_request_timeout_ms(),
            models: HashMap::new(),
            providers: HashMap::new(),
        }
    }
}

// ── Tools (confirmation policy, C6) ───────────────────────────────────────────

fn default_confirmation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve tool calls whose command string matches one of
    /// these glob patterns.
    #[serde(default)]
    pub auto_approve_patterns: Vec<String>,
    /// Deny (never run) tool calls matching one of these glob patterns.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec!["cat *".into(), "ls *".into(), "grep *".into()],
            deny_patterns: vec!["rm -rf /*".into()],
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_router_tier_is_balanced_model_gpt4o() {
        let c = Config::default();
        assert_eq!(c.router.balanced_model, "gpt-4o");
    }

    #[test]
    fn config_default_temperature_is_0_7() {
        let c = Config::default();
        assert_eq!(c.router.temperature, 0.7);
    }

    #[test]
    fn config_default_dynamic_tier_enabled() {
        assert!(Config::default().router.dynamic_tier_enabled);
    }

    #[test]
    fn config_default_compaction_threshold_fields() {
        let c = CompactionConfig::default();
        assert_eq!(c.max_context_tokens, 128_000);
        assert_eq!(c.keep_last_messages, 10);
        assert_eq!(c.chars_per_token, 3.5);
        assert_eq!(c.system_prompt_overhead_tokens, 8_000);
        assert_eq!(c.max_tool_result_chars, 100_000);
    }

    #[test]
    fn config_default_tool_loop_fields() {
        let c = ToolLoopConfig::default();
        assert_eq!(c.max_iterations, 10);
        assert_eq!(c.turn_deadline_ms, 600_000);
        assert_eq!(c.tool_timeout_ms, 30_000);
        assert_eq!(c.tool_timeout_cap_ms, 300_000);
        assert_eq!(c.repeat_guard_threshold, 3);
        assert_eq!(c.max_tool_failures, 5);
        assert!(!c.parallel_tools);
        assert!(c.max_tool_calls_per_iteration.is_none());
    }

    #[test]
    fn config_partial_yaml_fills_in_defaults() {
        let yaml_str = "tool_loop:\n  max_iterations: 3\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.tool_loop.max_iterations, 3);
        assert_eq!(c.tool_loop.repeat_guard_threshold, 3);
        assert_eq!(c.compaction.max_context_tokens, 128_000);
    }

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml_str = serde_yaml::to_string(&c).unwrap();
        assert!(yaml_str.contains("balanced_model"));
    }

    #[test]
    fn compaction_strategy_display() {
        assert_eq!(CompactionStrategy::Structured.to_string(), "structured");
        assert_eq!(CompactionStrategy::Narrative.to_string(), "narrative");
    }

    #[test]
    fn model_table_entry_deserializes_from_yaml() {
        let yaml_str = "llm:\n  models:\n    o1:\n      provider: openai\n      reasoning_required: true\n      supports_temperature: false\n      max_input_tokens: 200000\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        let entry = c.llm.models.get("o1").unwrap();
        assert!(entry.reasoning_required);
        assert!(!entry.supports_temperature);
        assert_eq!(entry.max_input_tokens, 200_000);
    }

    #[test]
    fn tools_config_default_has_auto_approve_patterns() {
        let c = ToolsConfig::default();
        assert!(!c.auto_approve_patterns.is_empty());
    }
}
