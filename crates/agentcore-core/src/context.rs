// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `TurnContext` and the small value types threaded through one pipeline
//! invocation: `TierPreference`, `ToolExecutionOutcome`, `LoopDecision`.
//!
//! `TurnContext` does not borrow the `Session` it was built from — Rust's
//! ownership rules make a self-referential "context that also points at the
//! session it came from" awkward, so stages that need to mutate the
//! canonical log (`Compactor`, `ToolLoop`, the memory-persist stage) receive
//! `&mut Session` alongside `&mut TurnContext` instead. The behavioral
//! contract is unchanged: the working view starts identical to the session's
//! tail, and nothing outside `Session::push`/`replace_prefix` touches the raw
//! log.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::diagnostics::Diagnostics;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Balanced,
    Smart,
    Coding,
    Deep,
}

impl Tier {
    /// Ordering used to enforce the never-downgrade rule (P3): a later tier
    /// in this list is strictly "more capable", never "more upgraded" in a
    /// cyclical sense — upgrades only ever move rightwards.
    fn rank(self) -> u8 {
        match self {
            Tier::Balanced => 0,
            Tier::Smart => 1,
            Tier::Coding => 2,
            Tier::Deep => 3,
        }
    }

    pub fn is_upgrade_from(self, current: Tier) -> bool {
        self.rank() > current.rank()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierPreference {
    pub tier: Tier,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolStatus {
    Success,
    Failed,
    Blocked,
    Skipped,
    Timeout,
    Invalid,
}

/// A single file/image surfaced by a tool's output, stripped out of
/// `resultText` and forwarded to `OutboundSender` for the final turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime: String,
    pub data_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionOutcome {
    pub tool_call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub result_text: String,
    pub error_code: Option<String>,
    pub duration_ms: u64,
    /// True for a result ToolLoop synthesized at closure rather than one
    /// that actually reached `ToolExecutor::execute`.
    pub synthetic: bool,
    pub truncated: bool,
    pub attachment: Option<Attachment>,
}

impl ToolExecutionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ToolStatus::Failed | ToolStatus::Timeout | ToolStatus::Invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    FinalAnswer,
    MaxIterations,
    Deadline,
    RepeatGuard,
    ToolFailurePolicy,
    UserCancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopDecision {
    pub continue_: bool,
    pub reason: StopReason,
}

/// Error captured by a pipeline stage, distinct from the typed errors each
/// component raises internally — this is what `ctx.stage_error` carries
/// forward for `Route` to report.
#[derive(Debug, Clone)]
pub struct StageError {
    pub stage: String,
    pub cause: String,
}

/// Lives for one pipeline invocation; discarded once the turn completes.
pub struct TurnContext {
    pub turn_id: Uuid,
    pub conversation_key: String,
    /// Working message list, initially a clone of the session's tail.
    /// Mutated freely within the turn; never written back wholesale — the
    /// raw log only grows through `Session::push`/`replace_prefix`.
    pub messages: Vec<Message>,
    pub tier_preference: TierPreference,
    pub model_tier: Tier,
    pub selected_model: String,
    pub reasoning_effort: Option<String>,
    pub iteration: u32,
    pub turn_deadline: Instant,
    pub llm_error: Option<String>,
    pub stage_error: Option<StageError>,
    pub final_answer_ready: bool,
    pub loop_decision: Option<LoopDecision>,
    pub diagnostics: Diagnostics,
    pub cancellation: watch::Receiver<bool>,
}

impl TurnContext {
    pub fn new(
        conversation_key: impl Into<String>,
        messages: Vec<Message>,
        turn_deadline: Instant,
        cancellation: watch::Receiver<bool>,
    ) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            conversation_key: conversation_key.into(),
            messages,
            tier_preference: TierPreference::default(),
            model_tier: Tier::default(),
            selected_model: String::new(),
            reasoning_effort: None,
            iteration: 0,
            turn_deadline,
            llm_error: None,
            stage_error: None,
            final_answer_ready: false,
            loop_decision: None,
            diagnostics: Diagnostics::default(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }

    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() > self.turn_deadline
    }

    /// Apply an upgrade decision honoring the never-downgrade rule (P3) and
    /// the force-lock (tier-force disables dynamic upgrade entirely).
    pub fn try_upgrade_tier(&mut self, candidate: Tier) -> bool {
        if self.tier_preference.force {
            return false;
        }
        if candidate.is_upgrade_from(self.model_tier) {
            self.model_tier = candidate;
            true
        } else {
            false
        }
    }
}
