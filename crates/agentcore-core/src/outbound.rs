// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OutboundSender (C9): chunk a final answer to fit a channel's hard cap
//! and deliver it, attachments last, under rate limiting.

use std::time::Duration;

use crate::context::Attachment;
use crate::ports::{ChannelError, ChannelPort};
use crate::rate_limiter::{channel_scope, RateLimiter};
use base64::Engine;

const CODE_FENCE_MARKER: &str = "```";
const PRE_TAG_OPEN: &str = "<pre";
const PRE_TAG_CLOSE: &str = "</pre>";

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("rate limited: wait {0:?} before retrying")]
    RateLimited(Duration),
    #[error("channel send failed: {0}")]
    Channel(#[from] ChannelError),
}

/// Splits `text` into chunks no longer than `max_chars`, preferring a
/// paragraph boundary (`\n\n`), then a line boundary (`\n`), and avoiding a
/// cut that would fall inside an open code fence or `<pre>` block when a
/// safe boundary exists within the first ¾ of the candidate slice.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > max_chars {
        let slice_end_byte = char_boundary_at(remaining, max_chars);
        let slice = &remaining[..slice_end_byte];
        let min_safe_byte = char_boundary_at(remaining, (max_chars * 3) / 4);

        let split_at = best_split_point(slice, min_safe_byte).unwrap_or(slice_end_byte);
        let (head, tail) = remaining.split_at(split_at);
        let head = head.trim_end_matches('\n');
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        remaining = tail.trim_start_matches('\n');
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

fn char_boundary_at(text: &str, char_count: usize) -> usize {
    text.char_indices().nth(char_count).map(|(i, _)| i).unwrap_or(text.len())
}

/// Finds the rightmost paragraph/line boundary within `slice` that is at or
/// past `min_safe_byte` and does not land inside an open fence/`<pre>` block.
fn best_split_point(slice: &str, min_safe_byte: usize) -> Option<usize> {
    let paragraph = slice.rfind("\n\n").map(|i| i + 2);
    let candidate = paragraph.filter(|&i| i >= min_safe_byte && !splits_open_block(&slice[..i]));
    if candidate.is_some() {
        return candidate;
    }
    let line = slice.rfind('\n').map(|i| i + 1);
    line.filter(|&i| i >= min_safe_byte && !splits_open_block(&slice[..i]))
}

fn splits_open_block(head: &str) -> bool {
    head.matches(CODE_FENCE_MARKER).count() % 2 == 1 || head.matches(PRE_TAG_OPEN).count() != head.matches(PRE_TAG_CLOSE).count()
}

pub struct OutboundSender<'a> {
    pub channel: &'a dyn ChannelPort,
    pub limiter: &'a RateLimiter,
    pub channel_type: &'a str,
    pub channel_messages_per_second: u32,
    pub max_chars: usize,
}

impl<'a> OutboundSender<'a> {
    /// Delivers `text` as one or more rate-limited chunks, then every
    /// attachment in order, to `chat_id`.
    pub async fn send_turn(&self, chat_id: &str, text: &str, attachments: &[Attachment]) -> Result<(), SendError> {
        for chunk in chunk_text(text, self.max_chars) {
            self.admit().await?;
            if self.channel.send_text(chat_id, &chunk).await.is_err() {
                self.channel.send_text(chat_id, &chunk).await?;
            }
        }
        for attachment in attachments {
            self.admit().await?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&attachment.data_base64)
                .unwrap_or_default();
            self.channel.send_attachment(chat_id, &bytes, &attachment.filename, None).await?;
        }
        Ok(())
    }

    async fn admit(&self) -> Result<(), SendError> {
        let result = self.limiter.try_consume(
            &channel_scope(self.channel_type),
            1,
            self.channel_messages_per_second,
            Duration::from_secs(1),
        );
        if result.allowed {
            Ok(())
        } else {
            Err(SendError::RateLimited(result.wait_hint.unwrap_or_default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingChannelPort;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("hello world", 4096);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn splits_at_paragraph_boundary_when_possible() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_text(&text, 60);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn falls_back_to_line_boundary_without_paragraph_break() {
        let text = format!("{}\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_text(&text, 60);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn never_produces_a_chunk_longer_than_the_cap() {
        let text = "word ".repeat(2000);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }

    #[test]
    fn avoids_splitting_inside_an_open_code_fence_when_a_safe_boundary_exists() {
        let text = format!("intro line\n\n```rust\n{}\n```\n\nmore text", "x".repeat(40));
        let chunks = chunk_text(&text, 50);
        for chunk in &chunks {
            assert_eq!(chunk.matches(CODE_FENCE_MARKER).count() % 2, 0);
        }
    }

    #[tokio::test]
    async fn sends_text_chunks_then_attachments_in_order() {
        let channel = RecordingChannelPort::new();
        let limiter = RateLimiter::new();
        let sender = OutboundSender {
            channel: &channel,
            limiter: &limiter,
            channel_type: "telegram",
            channel_messages_per_second: 100,
            max_chars: 4096,
        };
        let attachment = Attachment {
            filename: "a.png".into(),
            mime: "image/png".into(),
            data_base64: base64::engine::general_purpose::STANDARD.encode("fake-bytes"),
        };
        sender.send_turn("chat-1", "hello", std::slice::from_ref(&attachment)).await.unwrap();
        let sent_text = channel.sent_text.lock().unwrap();
        let sent_attachments = channel.sent_attachments.lock().unwrap();
        assert_eq!(sent_text.len(), 1);
        assert_eq!(sent_attachments.len(), 1);
    }

    #[tokio::test]
    async fn send_is_denied_once_channel_scope_capacity_is_exhausted() {
        let channel = RecordingChannelPort::new();
        let limiter = RateLimiter::new();
        let sender = OutboundSender {
            channel: &channel,
            limiter: &limiter,
            channel_type: "telegram",
            channel_messages_per_second: 1,
            max_chars: 4096,
        };
        sender.send_turn("chat-1", "first", &[]).await.unwrap();
        let err = sender.send_turn("chat-1", "second", &[]).await.unwrap_err();
        assert!(matches!(err, SendError::RateLimited(_)));
    }
}
