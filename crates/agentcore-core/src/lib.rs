// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent execution pipeline's core: the canonical conversation log,
//! the per-turn state machine, and the stages that move a message from
//! inbound sanitization through the tool-calling loop to an outbound reply.
//!
//! Module map mirrors the component table: `rate_limiter` (C1),
//! `request_view` (C2), `router` (C3), `tier_upgrade` (C4), `compactor`
//! (C5), `executor` (C6), `tool_loop` (C7), `pipeline` (C8), `outbound`
//! (C9), `sanitizer` (C10/C11), `diagnostics` (C12). `context`, `message`
//! and `ports` hold the shared value types and external-facing traits
//! every stage is built around.

pub mod compactor;
pub mod context;
pub mod diagnostics;
pub mod executor;
pub mod message;
pub mod outbound;
pub mod pipeline;
pub mod ports;
pub mod rate_limiter;
pub mod request_view;
pub mod router;
pub mod sanitizer;
pub mod testing;
pub mod tier_upgrade;
pub mod tool_loop;

pub use context::{
    Attachment, LoopDecision, StageError, Tier, TierPreference, ToolExecutionOutcome, ToolStatus,
    StopReason, TurnContext,
};
pub use diagnostics::{Diagnostics, LoopTrace, MaskingRecord, TierDecision, TruncationRecord};
pub use executor::ToolExecutor;
pub use message::{Message, Role, Session, SessionError, SessionMetadata, ToolCall};
pub use outbound::{OutboundSender, SendError};
pub use pipeline::{Pipeline, PipelineError};
pub use ports::{ChannelError, ChannelPort, ConfirmationOutcome, SessionStore, TurnLockRegistry};
pub use rate_limiter::{ConsumeResult, RateLimiter};
pub use request_view::{ProviderKey, RemapRegistry, RequestViewError, ViewDiagnostics};
pub use router::{ResolvedModel, RouterError};
pub use sanitizer::{sanitize, SanitizeOutcome, Threat, ThreatPatterns};
pub use tool_loop::{ToolLoopDeps, ToolLoopOutcome};
