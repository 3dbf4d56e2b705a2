// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider-facing wire types and the LLM provider port.
//!
//! This crate is the "request view" layer: the shapes a concrete provider
//! driver would serialize onto the wire, as opposed to the canonical
//! conversation log owned by `agentcore-core`. `RequestViewBuilder`
//! (`agentcore-core`) projects the canonical log into `Vec<Message>` here
//! before handing it to a [`provider::ModelProvider`].

pub mod catalog;
pub mod mock;
pub mod provider;
pub mod types;

pub use mock::{EchoProvider, RepeatingProvider};
pub use provider::{ModelProvider, ProviderError, ResponseStream};
pub use types::{
    CompletionRequest, CompletionResponse, ContentPart, FunctionCall, Message, MessageContent,
    ResponseEvent, Role, ToolCallPart, ToolContentPart, ToolResultContent, ToolSchema, Usage,
};
