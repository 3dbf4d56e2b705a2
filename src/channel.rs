// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `ChannelPort` for the demo binary: prints to stdout and auto-approves
//! confirmations. A real deployment wires a channel transport (Telegram,
//! Slack, ...) behind this same trait instead.

use std::time::Duration;

use async_trait::async_trait;

use agentcore_core::{ChannelError, ChannelPort, ConfirmationOutcome};

pub struct ConsoleChannelPort;

#[async_trait]
impl ChannelPort for ConsoleChannelPort {
    async fn send_text(&self, _chat_id: &str, content: &str) -> Result<(), ChannelError> {
        println!("{content}");
        Ok(())
    }

    async fn send_attachment(
        &self,
        _chat_id: &str,
        bytes: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        println!("[attachment: {filename}, {} bytes]", bytes.len());
        if let Some(c) = caption {
            println!("{c}");
        }
        Ok(())
    }

    async fn show_typing(&self, _chat_id: &str) {}

    async fn request_confirmation(&self, _chat_id: &str, prompt: &str, _timeout: Duration) -> ConfirmationOutcome {
        // The demo binary runs one turn non-interactively; auto-approve so a
        // destructive-tool confirmation never stalls the CLI waiting on an
        // input stream nothing is driving.
        eprintln!("[auto-approved] {prompt}");
        ConfirmationOutcome::Approved
    }
}
