// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod channel;
mod cli;
mod store;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use agentcore_core::{Pipeline, TierPreference};
use agentcore_model::EchoProvider;
use agentcore_tools::{EchoTool, ToolRegistry};

use channel::ConsoleChannelPort;
use cli::{Cli, Commands};
use store::FileSessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::ShowConfig => show_config(cli.config.as_deref()),
        Commands::Chat { conversation, message, tier, force_tier } => {
            run_chat(cli.config.as_deref(), conversation, message, tier, force_tier).await
        }
    }
}

fn show_config(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = agentcore_config::load(config_path)?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

/// Runs exactly one turn of the pipeline (§2: one inbound message in, one
/// outbound final answer out) against a file-backed session, printing the
/// reply to stdout via `ConsoleChannelPort`.
///
/// No real LLM provider or tool inventory is wired up here — those are
/// external collaborators per §1 of the spec. `EchoProvider` and `EchoTool`
/// exist so the pipeline itself (rate limiting, sanitization, compaction,
/// the tool loop, routing, outbound delivery) can be exercised end to end
/// without any network dependency.
async fn run_chat(
    config_path: Option<&std::path::Path>,
    conversation: String,
    message: String,
    tier: cli::TierArg,
    force_tier: bool,
) -> anyhow::Result<()> {
    let config = agentcore_config::load(config_path)?;

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);

    let channel: Arc<dyn agentcore_core::ChannelPort> = Arc::new(ConsoleChannelPort);
    let provider: Arc<dyn agentcore_model::ModelProvider> = Arc::new(EchoProvider);
    let session_store: Arc<dyn agentcore_core::SessionStore> =
        Arc::new(FileSessionStore::new(store::default_base_dir()));

    let pipeline = Pipeline::new(config, registry, channel, provider, session_store, "cli");

    let tier_preference = TierPreference { tier: tier.into(), force: force_tier };
    let (_tx, cancellation) = watch::channel(false);

    let ctx = pipeline
        .run_turn(&conversation, "cli", message, tier_preference, cancellation)
        .await?;

    if let Some(decision) = ctx.loop_decision {
        tracing::debug!(?decision.reason, iterations = ctx.iteration, "turn finished");
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
