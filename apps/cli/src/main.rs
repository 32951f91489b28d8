//! Ensemble CLI - command-line front end for the agent runtime
//!
//! Provides the `ens` command: list agent kinds and configured agents, send a
//! message to an agent, or run an orchestration plan from a TOML file.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ensemble_orchestrator::config::{ENVIRONMENT_VAR, RuntimeConfig};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "ensemble.toml";

/// Ensemble - multi-agent runtime and orchestration
#[derive(Parser, Debug)]
#[command(name = "ens", author, version, about = "Ensemble - multi-agent runtime and orchestration")]
struct Args {
    /// Path to the runtime configuration (defaults to ./ensemble.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the agent kinds this build can construct
    Kinds,

    /// List the agents declared in the configuration
    Agents,

    /// Send a message to an agent and stream the reply
    Send {
        /// Agent identifier
        agent: String,

        /// Message content
        message: String,

        /// Session to publish on
        #[arg(short, long, default_value = "cli")]
        session: String,
    },

    /// Run an orchestration plan
    Plan {
        /// Path to the plan file
        file: PathBuf,

        /// Override the plan's session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Validate the configuration and print the effective settings
    Check,
}

fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(format!("ensemble={level},ens={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "ensemble=info,ens=info".into()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    let default_path = Path::new(DEFAULT_CONFIG_FILE);
    let path = match path {
        Some(path) => Some(path),
        None if default_path.exists() => Some(default_path),
        None => None,
    };

    match path {
        Some(path) => {
            debug!(path = %path.display(), "Loading configuration");
            RuntimeConfig::load_from_toml(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))
        }
        None => {
            debug!("No configuration file; using defaults");
            let environment = std::env::var(ENVIRONMENT_VAR).ok();
            Ok(RuntimeConfig::new().with_environment_override(environment.as_deref())?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Kinds => commands::kinds::execute(args.json),
        Command::Agents => commands::agents::execute(&config, args.json),
        Command::Send { agent, message, session } => {
            commands::send::execute(config, &agent, &message, &session, args.json).await
        }
        Command::Plan { file, session } => {
            commands::plan::execute(config, &file, session, args.json).await
        }
        Command::Check => commands::agents::check(&config, args.json),
    }
}
