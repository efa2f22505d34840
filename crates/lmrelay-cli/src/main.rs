//! lmrelay: relay browser chat clients to a local LLM agent
//!
//! Usage:
//!   lmrelay serve [--port 3000]
//!   lmrelay agent [--url ws://localhost:3000/agent] [--model qwen3-4b-2507]
//!   lmrelay chat "hello" [--url ws://localhost:3000/chat] [--origin https://a.example.com]
//!   lmrelay models

mod chat;
mod config;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lmrelay_agent::{Agent, CompletionBridge, LinkManager, LmStudioClient, WsConnector};
use lmrelay_gateway::RelayServer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PORT_ENV};

#[derive(Parser)]
#[command(
    name = "lmrelay",
    version,
    about = "WebSocket relay for a local LLM agent"
)]
struct Cli {
    /// Config file (default: ~/.lmrelay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve {
        /// Listen port; overrides the config file and PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect an agent to the relay and answer prompts
    Agent {
        /// Relay agent endpoint
        #[arg(long)]
        url: Option<String>,
        /// Model to request from the completion server
        #[arg(long)]
        model: Option<String>,
    },
    /// Send one prompt through the relay and print the reply
    Chat {
        prompt: String,
        /// Chat endpoint (default: the relay in the [server] section)
        #[arg(long)]
        url: Option<String>,
        /// Origin header to send
        #[arg(long)]
        origin: Option<String>,
    },
    /// List the models the completion server offers
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { port } => {
            let env_port = std::env::var(PORT_ENV).ok();
            config.override_port(env_port.as_deref(), port)?;
            serve(config).await
        }
        Command::Agent { url, model } => {
            if let Some(url) = url {
                config.agent.relay_url = url;
            }
            if let Some(model) = model {
                config.agent.completion.model = model;
            }
            run_agent(config).await
        }
        Command::Chat {
            prompt,
            url,
            origin,
        } => {
            let env_port = std::env::var(PORT_ENV).ok();
            config.override_port(env_port.as_deref(), None)?;
            let url = url.unwrap_or_else(|| config.chat_url());
            debug!("Chatting via {}", url);

            let mut stdout = std::io::stdout();
            chat::ask(&url, origin.as_deref(), &prompt, |chunk| {
                let _ = write!(stdout, "{}", chunk);
                let _ = stdout.flush();
            })
            .await?;
            println!();
            Ok(())
        }
        Command::Models => {
            let client = LmStudioClient::new(config.agent.completion.base_url.clone())?;
            let models = client
                .list_models()
                .await
                .with_context(|| format!("Failed to list models from {}", client.base_url()))?;
            for model in models {
                println!("{}", model);
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                trigger.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
    });
    token
}

async fn serve(config: Config) -> Result<()> {
    info!("lmrelay v{} starting relay", env!("CARGO_PKG_VERSION"));
    let server = RelayServer::new(config.server).context("Invalid relay configuration")?;
    let addr = server.config().listen_addr();
    server
        .bind_and_serve(shutdown_on_ctrl_c())
        .await
        .with_context(|| format!("Relay failed on {}", addr))
}

async fn run_agent(config: Config) -> Result<()> {
    let agent_config = config.agent;
    info!(
        "lmrelay v{} starting agent (relay: {}, model: {})",
        env!("CARGO_PKG_VERSION"),
        agent_config.relay_url,
        agent_config.completion.model
    );

    let client = LmStudioClient::new(agent_config.completion.base_url.clone())?;
    let bridge = CompletionBridge::new(Arc::new(client), agent_config.completion);
    let (link, events) = LinkManager::spawn(agent_config.link, WsConnector);

    let agent = Agent::new(link, events, bridge);
    let shutdown = shutdown_on_ctrl_c();
    if let Err(e) = agent.run(&agent_config.relay_url, shutdown).await {
        error!("Agent stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
