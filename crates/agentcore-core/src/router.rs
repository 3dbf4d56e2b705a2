// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ModelRouter (C3): resolve `(tier → model, reasoning effort)` and enforce
//! the tier-force lock.
//!
//! Name resolution and tier resolution are both pure functions over
//! configuration so they're unit-testable without a running provider.

use agentcore_config::{ModelTableEntry, RouterConfig};
use agentcore_model::catalog;

use crate::context::{Tier, TierPreference};

#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub capabilities: ModelTableEntry,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no model configured for tier {0:?}")]
    NoModelForTier(Tier),
}

/// Tier resolution priority (highest first): (1) user force-locked
/// preference, (2) the active skill's declared tier, (3) user preference
/// without force, (4) fallback `balanced`. A force lock disables both the
/// skill override and any later dynamic upgrade.
pub fn resolve_tier(preference: TierPreference, active_skill_tier: Option<Tier>) -> Tier {
    if preference.force {
        return preference.tier;
    }
    if let Some(skill_tier) = active_skill_tier {
        return skill_tier;
    }
    preference.tier
}

fn model_and_reasoning_for_tier(tier: Tier, cfg: &RouterConfig) -> (String, Option<String>) {
    match tier {
        Tier::Balanced => (cfg.balanced_model.clone(), cfg.balanced_reasoning.clone()),
        Tier::Smart => (cfg.smart_model.clone(), cfg.smart_reasoning.clone()),
        Tier::Coding => (cfg.coding_model.clone(), cfg.coding_reasoning.clone()),
        Tier::Deep => (cfg.deep_model.clone(), cfg.deep_reasoning.clone()),
    }
}

fn conservative_default() -> ModelTableEntry {
    ModelTableEntry {
        provider: "unknown".into(),
        reasoning_required: false,
        supports_temperature: true,
        max_input_tokens: 128_000,
    }
}

/// Name resolution: exact (configured table) → strip provider prefix
/// (`openai/gpt-5.1` → `gpt-5.1`, retried against the table) → longest-prefix
/// match against the table → built-in catalog → conservative default.
pub fn resolve_capabilities(model_name: &str, table: &[(&str, ModelTableEntry)]) -> ModelTableEntry {
    if let Some((_, entry)) = table.iter().find(|(name, _)| *name == model_name) {
        return entry.clone();
    }
    let stripped = model_name.split_once('/').map(|(_, rest)| rest);
    if let Some(stripped) = stripped {
        if let Some((_, entry)) = table.iter().find(|(name, _)| *name == stripped) {
            return entry.clone();
        }
    }
    let mut best: Option<&(&str, ModelTableEntry)> = None;
    for candidate in table {
        if model_name.starts_with(candidate.0) {
            match best {
                Some((best_name, _)) if best_name.len() >= candidate.0.len() => {}
                _ => best = Some(candidate),
            }
        }
    }
    if let Some((_, entry)) = best {
        return entry.clone();
    }
    if let Some(entry) = catalog::lookup(model_name) {
        return to_table_entry(entry);
    }
    if let Some(stripped) = stripped {
        if let Some(entry) = catalog::lookup(stripped) {
            return to_table_entry(entry);
        }
    }
    conservative_default()
}

fn to_table_entry(e: &catalog::ModelCatalogEntry) -> ModelTableEntry {
    ModelTableEntry {
        provider: e.provider.to_string(),
        reasoning_required: e.reasoning_required,
        supports_temperature: e.supports_temperature,
        max_input_tokens: e.max_input_tokens,
    }
}

/// Resolve a tier all the way down to a concrete model + reasoning effort +
/// capability row, consulting user configuration then the built-in catalog.
pub fn resolve(
    preference: TierPreference,
    active_skill_tier: Option<Tier>,
    router_cfg: &RouterConfig,
    model_table: &[(&str, ModelTableEntry)],
) -> ResolvedModel {
    let tier = resolve_tier(preference, active_skill_tier);
    let (model, reasoning_effort) = model_and_reasoning_for_tier(tier, router_cfg);
    let capabilities = resolve_capabilities(&model, model_table);
    ResolvedModel {
        model,
        reasoning_effort,
        capabilities,
    }
}
