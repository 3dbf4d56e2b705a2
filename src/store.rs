// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A minimal on-disk `SessionStore` for the demo binary: one JSON document
//! per conversation key under a base directory, matching the persisted
//! state layout in §6 of the spec (`messages` array preserving
//! `providerFields`/`metadata`). Real deployments wire a proper session
//! storage backend instead — this is only here so `agentcore chat` can
//! resume a conversation across invocations without one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use agentcore_core::{Message, Session, SessionError, SessionStore};

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    conversation_key: String,
    messages: Vec<Message>,
}

fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// File-backed `SessionStore`. Serializes whole-file read/modify/write under
/// one lock — adequate for a single interactive CLI process, not for
/// concurrent multi-process access.
pub struct FileSessionStore {
    base_dir: PathBuf,
    guard: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), guard: Mutex::new(()) }
    }

    fn path_for(&self, conversation_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", sanitize_filename(conversation_key)))
    }

    fn read_session(&self, conversation_key: &str) -> Option<Session> {
        let path = self.path_for(conversation_key);
        let text = std::fs::read_to_string(&path).ok()?;
        let persisted: PersistedSession = serde_json::from_str(&text).ok()?;
        let mut session = Session::new(persisted.conversation_key);
        session.push_many(persisted.messages);
        Some(session)
    }

    fn write_session(&self, session: &Session) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let persisted = PersistedSession {
            conversation_key: session.conversation_key.clone(),
            messages: session.messages().to_vec(),
        };
        let text = serde_json::to_string_pretty(&persisted).unwrap_or_default();
        std::fs::write(self.path_for(&session.conversation_key), text)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, conversation_key: &str) -> Option<Session> {
        let _guard = self.guard.lock().await;
        self.read_session(conversation_key)
    }

    async fn append(&self, conversation_key: &str, messages: Vec<Message>) {
        let _guard = self.guard.lock().await;
        let mut session = self.read_session(conversation_key).unwrap_or_else(|| Session::new(conversation_key));
        session.push_many(messages);
        let _ = self.write_session(&session);
    }

    async fn replace_prefix(&self, conversation_key: &str, prefix_len: usize, summary: Message) -> Result<(), SessionError> {
        let _guard = self.guard.lock().await;
        let mut session = self.read_session(conversation_key).unwrap_or_else(|| Session::new(conversation_key));
        session.replace_prefix(prefix_len, summary)?;
        let _ = self.write_session(&session);
        Ok(())
    }

    async fn list_recent(&self, conversation_key: &str, limit: usize) -> Vec<Message> {
        let _guard = self.guard.lock().await;
        match self.read_session(conversation_key) {
            Some(s) => {
                let msgs = s.messages();
                let start = msgs.len().saturating_sub(limit);
                msgs[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

pub fn default_base_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("agentcore").join("sessions")
}

pub fn resolve_base_dir(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(default_base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_load_round_trips_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.append("conv-1", vec![Message::user("hi"), Message::assistant("hello")]).await;
        let loaded = store.load("conv-1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.messages()[0].content, "hi");
    }

    #[tokio::test]
    async fn load_missing_conversation_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.load("nope").await.is_none());
    }

    #[tokio::test]
    async fn replace_prefix_persists_the_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.append("conv-1", vec![Message::user("a"), Message::assistant("b"), Message::user("c")]).await;
        let summary = Message::system("summary").mark_as_compaction_summary();
        store.replace_prefix("conv-1", 2, summary).await.unwrap();
        let loaded = store.load("conv-1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.messages()[0].is_compaction_summary());
    }

    #[tokio::test]
    async fn list_recent_returns_the_trailing_slice() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.append("conv-1", vec![Message::user("a"), Message::assistant("b"), Message::user("c")]).await;
        let recent = store.list_recent("conv-1", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "b");
    }

    #[test]
    fn sanitize_filename_strips_path_separators() {
        assert_eq!(sanitize_filename("conv/../etc"), "conv_.._etc");
    }
}
