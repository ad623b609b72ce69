//! # A2A Node
//!
//! Runs a single node (transport, task manager, health, alerts, persistence)
//! or validates configuration without starting anything.

use std::path::PathBuf;
use std::sync::Arc;

use a2a_core::config::{A2aConfig, ConfigManager};
use a2a_core::logging::init_structured_logging;
use a2a_core::messaging::{InMemoryBroker, PubSubConnector};
use a2a_core::orchestration::{task_handler_fn, TaskInfo};
use a2a_core::system_context::{Collaborators, SystemContext};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "a2a-node")]
#[command(about = "Agent-to-agent messaging reliability node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: $A2A_CONFIG_DIR or ./config)
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Environment overlay to load (default: $A2A_ENV, $APP_ENV or development)
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until Ctrl-C
    Run {
        /// Override the configured service id
        #[arg(long)]
        service_id: Option<String>,
    },

    /// Load and validate configuration, then print it as JSON
    ValidateConfig,
}

fn load_config(cli: &Cli) -> Result<ConfigManager> {
    let environment = cli
        .environment
        .clone()
        .unwrap_or_else(ConfigManager::detect_environment);
    let manager = match &cli.config_dir {
        Some(dir) => ConfigManager::load_from_dir(dir, &environment),
        None => ConfigManager::load().map(|m| (*m).clone()),
    };
    manager.context("Failed to load configuration")
}

fn connector_for(config: &A2aConfig) -> Result<Arc<dyn PubSubConnector>> {
    match config.transport.provider.as_str() {
        "in_memory" => Ok(InMemoryBroker::new().connector()),
        #[cfg(feature = "nats")]
        "nats" => Ok(Arc::new(a2a_core::messaging::providers::NatsConnector::new(
            config.transport.url.clone(),
            config.service.service_id.clone(),
        ))),
        #[cfg(not(feature = "nats"))]
        "nats" => bail!("Transport provider 'nats' requires building with the `nats` feature"),
        other => bail!("Unsupported transport provider '{other}'"),
    }
}

async fn run(cli: &Cli, service_id: Option<String>) -> Result<()> {
    let mut config = load_config(cli)?.into_config();
    if let Some(service_id) = service_id {
        config.service.service_id = service_id;
    }
    init_structured_logging(&config.logging);

    let connector = connector_for(&config)?;
    let context = SystemContext::bootstrap(config, connector, Collaborators::in_memory())
        .await
        .context("Failed to bootstrap node")?;

    context.task_manager.register_task_handler(
        "echo",
        task_handler_fn(|task: TaskInfo| async move { Ok(task.parameters) }),
    );
    context.announce().await.context("Failed to announce node")?;

    info!(
        service_id = %context.config.service.service_id,
        capabilities = ?context.task_manager.capabilities(),
        "Node running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    context.shutdown().await;
    Ok(())
}

fn validate_config(cli: &Cli) -> Result<()> {
    let manager = load_config(cli)?;
    let rendered = serde_json::to_string_pretty(manager.config())?;
    println!("# environment: {}", manager.environment());
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Run { service_id } => run(&cli, service_id.clone()).await,
        Commands::ValidateConfig => validate_config(&cli),
    }
}
