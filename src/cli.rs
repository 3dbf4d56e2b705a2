// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Tier names accepted on the command line; mirrors `agentcore_core::Tier`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierArg {
    Balanced,
    Smart,
    Coding,
    Deep,
}

impl From<TierArg> for agentcore_core::Tier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Balanced => agentcore_core::Tier::Balanced,
            TierArg::Smart => agentcore_core::Tier::Smart,
            TierArg::Coding => agentcore_core::Tier::Coding,
            TierArg::Deep => agentcore_core::Tier::Deep,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one turn of the pipeline against a conversation and print the reply.
    Chat {
        /// Conversation key; reused across invocations to continue a thread.
        #[arg(long, short = 'c', default_value = "default")]
        conversation: String,
        /// The inbound user message.
        message: String,
        /// Requested model tier.
        #[arg(long, value_enum, default_value = "balanced")]
        tier: TierArg,
        /// Lock the requested tier, disabling dynamic upgrade for this turn.
        #[arg(long)]
        force_tier: bool,
    },
    /// Print the fully merged configuration and exit.
    ShowConfig,
}

/// `agentcore`: run the agentic tool-loop pipeline from the command line.
#[derive(Parser, Debug)]
#[command(name = "agentcore", version, about, long_about = None)]
pub struct Cli {
    /// Extra config file layered on top of the discovered search path.
    #[arg(long, short = 'C', global = true)]
    pub config: Option<PathBuf>,
    /// Write tracing output to stderr (defaults to `RUST_LOG`-gated only).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}
