// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in defaults for the per-model static capability table described in
//! the configuration surface (`{provider, reasoningRequired,
//! supportsTemperature, maxInputTokens}`). `agentcore-core::ModelRouter`
//! looks a model name up here when the user's configuration doesn't
//! override it, the same layering the teacher's config crate uses for
//! every other default.

/// One row of the built-in model capability table.
#[derive(Debug, Clone, Copy)]
pub struct ModelCatalogEntry {
    pub name: &'static str,
    pub provider: &'static str,
    pub reasoning_required: bool,
    pub supports_temperature: bool,
    pub max_input_tokens: u32,
}

/// Static catalog of well-known models. Not exhaustive — entries absent here
/// and absent from user configuration fall back to `ModelRouter`'s
/// conservative default (no reasoning, supports temperature, 128k window).
pub fn static_catalog() -> &'static [ModelCatalogEntry] {
    &[
        ModelCatalogEntry {
            name: "gpt-4o",
            provider: "openai",
            reasoning_required: false,
            supports_temperature: true,
            max_input_tokens: 128_000,
        },
        ModelCatalogEntry {
            name: "gpt-4o-mini",
            provider: "openai",
            reasoning_required: false,
            supports_temperature: true,
            max_input_tokens: 128_000,
        },
        ModelCatalogEntry {
            name: "o1",
            provider: "openai",
            reasoning_required: true,
            supports_temperature: false,
            max_input_tokens: 200_000,
        },
        ModelCatalogEntry {
            name: "claude-sonnet-4-5",
            provider: "anthropic",
            reasoning_required: false,
            supports_temperature: true,
            max_input_tokens: 200_000,
        },
        ModelCatalogEntry {
            name: "claude-opus-4-5",
            provider: "anthropic",
            reasoning_required: false,
            supports_temperature: true,
            max_input_tokens: 200_000,
        },
        ModelCatalogEntry {
            name: "gemini-2.5-pro",
            provider: "google",
            reasoning_required: false,
            supports_temperature: true,
            max_input_tokens: 1_000_000,
        },
    ]
}

/// Look up a model by exact name.
pub fn lookup(name: &str) -> Option<&'static ModelCatalogEntry> {
    static_catalog().iter().find(|e| e.name == name)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_model_succeeds() {
        let e = lookup("gpt-4o").unwrap();
        assert_eq!(e.provider, "openai");
        assert!(!e.reasoning_required);
    }

    #[test]
    fn lookup_unknown_model_is_none() {
        assert!(lookup("nonexistent-model-xyz").is_none());
    }

    #[test]
    fn reasoning_model_does_not_support_temperature() {
        let e = lookup("o1").unwrap();
        assert!(e.reasoning_required);
        assert!(!e.supports_temperature);
    }

    #[test]
    fn catalog_entries_have_positive_context_window() {
        for e in static_catalog() {
            assert!(e.max_input_tokens > 0, "{} has zero context", e.name);
        }
    }
}
