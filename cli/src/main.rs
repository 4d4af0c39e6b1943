// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # fieldstudy CLI
//!
//! The `fieldstudy` binary drives study deployments from the command line.
//!
//! Every command builds the deployment service in-process from the node
//! configuration, runs once and exits. With the (default) file backend the
//! deployments persist between invocations.
//!
//! ## Commands
//!
//! - `fieldstudy protocol validate` - Parse a protocol manifest and list its issues
//! - `fieldstudy deployment create|status|list|stop` - Deployment lifecycle
//! - `fieldstudy device register|unregister|deployment|confirm [--events]` - Per-device operations
//! - `fieldstudy config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use fieldstudy_core::domain::node_config::NodeConfigManifest;
use fieldstudy_orchestrator::commands::{self, ConfigCommand, DeploymentCommand, DeviceCommand, ProtocolCommand};

/// fieldstudy - Deploy study protocols to participant devices
#[derive(Parser)]
#[command(name = "fieldstudy")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "FIELDSTUDY_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the
    /// configured `observability.log_level`.
    #[arg(long, global = true, env = "FIELDSTUDY_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Study protocol manifests
    #[command(name = "protocol")]
    Protocol {
        #[command(subcommand)]
        command: ProtocolCommand,
    },

    /// Study deployment lifecycle
    #[command(name = "deployment")]
    Deployment {
        #[command(subcommand)]
        command: DeploymentCommand,
    },

    /// Device registration and configuration
    #[command(name = "device")]
    Device {
        /// Print the deployment events the command produced
        #[arg(long, global = true)]
        events: bool,

        #[command(subcommand)]
        command: DeviceCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads env-backed arguments
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = match &cli.log_level {
        Some(level) => level.clone(),
        None => NodeConfigManifest::load_or_default(cli.config.clone())
            .map(|config| config.spec.observability.log_level)
            .unwrap_or_else(|_| "warn".to_string()),
    };
    init_logging(&log_level)?;

    match cli.command {
        Some(Commands::Protocol { command }) => commands::protocol::handle_command(command).await,
        Some(Commands::Deployment { command }) => {
            commands::deployment::handle_command(command, cli.config).await
        }
        Some(Commands::Device { events, command }) => {
            commands::device::handle_command(command, events, cli.config).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
