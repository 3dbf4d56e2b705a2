// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! External interfaces (§6): `ChannelPort` and `SessionStore`. Both are
//! `async_trait` traits with `Send + Sync` bounds so a runtime can hand out
//! `Arc<dyn Port>`. The tool port is reused as-is from `agentcore_tools`;
//! the LLM provider port from `agentcore_model`.
//!
//! Concrete implementations beyond what tests need are an external concern
//! (§1) — see `testing.rs` for the in-memory/scripted doubles this crate's
//! own tests run against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::message::{Message, Session, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("formatted send failed: {0}")]
    FormatFailed(String),
    #[error("send failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Approved,
    Denied,
    TimedOut,
}

/// Inbound/outbound channel port provided to the core.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    async fn send_text(&self, chat_id: &str, content: &str) -> Result<(), ChannelError>;
    async fn send_attachment(
        &self,
        chat_id: &str,
        bytes: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError>;
    async fn show_typing(&self, chat_id: &str);
    async fn request_confirmation(&self, chat_id: &str, prompt: &str, timeout: Duration) -> ConfirmationOutcome;
}

/// Session store port (§6). `replace_prefix` is the compaction entry point;
/// `load`/`append`/`list_recent` are the usual CRUD surface persistence
/// backends outside this scope must implement.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, conversation_key: &str) -> Option<Session>;
    async fn append(&self, conversation_key: &str, messages: Vec<Message>);
    async fn replace_prefix(
        &self,
        conversation_key: &str,
        prefix_len: usize,
        summary: Message,
    ) -> Result<(), SessionError>;
    async fn list_recent(&self, conversation_key: &str, limit: usize) -> Vec<Message>;
}

/// Per-`conversationKey` serialization (§5): turns for the same key acquire
/// this lock for their duration so session invariants hold under concurrent
/// inbound messages.
pub struct TurnLockRegistry {
    locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TurnLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn lock_for(&self, conversation_key: &str) -> Arc<AsyncMutex<()>> {
        if let Some(existing) = self.locks.read().get(conversation_key) {
            return existing.clone();
        }
        self.locks
            .write()
            .entry(conversation_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for TurnLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_for_same_key_returns_the_same_mutex() {
        let registry = TurnLockRegistry::new();
        let a = registry.lock_for("conv-1");
        let b = registry.lock_for("conv-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn lock_for_distinct_keys_returns_distinct_mutexes() {
        let registry = TurnLockRegistry::new();
        let a = registry.lock_for("conv-1");
        let b = registry.lock_for("conv-2");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn second_turn_for_same_key_waits_for_the_first() {
        let registry = TurnLockRegistry::new();
        let lock = registry.lock_for("conv-1");
        let guard = lock.lock().await;
        let lock2 = registry.lock_for("conv-1");
        let attempt = lock2.try_lock();
        assert!(attempt.is_err(), "second turn must not acquire while first holds the lock");
        drop(guard);
        assert!(lock2.try_lock().is_ok());
    }
}
