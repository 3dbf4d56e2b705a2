// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Diagnostics (C12): structured records of what the pipeline decided and
//! why, collected synchronously into `ctx.diagnostics` rather than broadcast
//! over an event channel — no external subscriber exists in this scope, so
//! a plain accumulator is the simpler match for the teacher's `AgentEvent`
//! idea.

use serde::{Deserialize, Serialize};

use crate::context::{StopReason, Tier, ToolExecutionOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDecision {
    pub from: Tier,
    pub to: Tier,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskingRecord {
    pub flattened_count: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationRecord {
    pub tool_call_id: String,
    pub total_chars: usize,
    pub shown_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopTrace {
    pub iterations: u32,
    pub stop_reason: StopReason,
    pub outcomes: Vec<ToolExecutionOutcome>,
}

/// Plain struct of push-only `Vec<T>` fields, read through accessors. Matches
/// the four record kinds from the component table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    tier_decisions: Vec<TierDecision>,
    masking_records: Vec<MaskingRecord>,
    truncation_records: Vec<TruncationRecord>,
    loop_traces: Vec<LoopTrace>,
}

impl Diagnostics {
    pub fn record_tier_decision(&mut self, d: TierDecision) {
        self.tier_decisions.push(d);
    }

    pub fn record_masking(&mut self, m: MaskingRecord) {
        self.masking_records.push(m);
    }

    pub fn record_truncation(&mut self, t: TruncationRecord) {
        self.truncation_records.push(t);
    }

    pub fn record_loop_trace(&mut self, l: LoopTrace) {
        self.loop_traces.push(l);
    }

    pub fn tier_decisions(&self) -> &[TierDecision] {
        &self.tier_decisions
    }

    pub fn masking_records(&self) -> &[MaskingRecord] {
        &self.masking_records
    }

    pub fn truncation_records(&self) -> &[TruncationRecord] {
        &self.truncation_records
    }

    pub fn loop_traces(&self) -> &[LoopTrace] {
        &self.loop_traces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_accumulates_tier_decisions_in_order() {
        let mut d = Diagnostics::default();
        d.record_tier_decision(TierDecision {
            from: Tier::Balanced,
            to: Tier::Coding,
            reason: "code file write".into(),
        });
        assert_eq!(d.tier_decisions().len(), 1);
        assert_eq!(d.tier_decisions()[0].to, Tier::Coding);
    }

    #[test]
    fn diagnostics_accessors_are_read_only_views() {
        let d = Diagnostics::default();
        assert!(d.masking_records().is_empty());
        assert!(d.truncation_records().is_empty());
        assert!(d.loop_traces().is_empty());
    }
}
