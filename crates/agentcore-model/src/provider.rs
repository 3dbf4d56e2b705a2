// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::{CompletionRequest, CompletionResponse, ResponseEvent};

pub type ResponseStream = BoxStream<'static, ResponseEvent>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// The LLM provider port (§6 of the design): a single chat call plus
/// optional streaming. Concrete wire drivers (OpenAI/Anthropic/etc.) are an
/// external collaborator; this crate only defines the seam and the test
/// double used by the pipeline's own tests.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Optional streaming variant. Providers that don't support streaming
    /// can leave this unimplemented; callers must check `is_available`-style
    /// capability flags before invoking it in practice.
    async fn chat_stream(
        &self,
        _request: CompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        Err(ProviderError::Unavailable(
            "streaming not supported by this provider".into(),
        ))
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        Vec::new()
    }
}
