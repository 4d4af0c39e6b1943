// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use fieldstudy_core::domain::node_config::{NodeConfigManifest, StorageBackend};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./fieldstudy-config.yaml)
        #[arg(short, long, default_value = "./fieldstudy-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. FIELDSTUDY_CONFIG_PATH: {}",
            std::env::var("FIELDSTUDY_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./fieldstudy-config.yaml");
        println!("  4. ~/.fieldstudy/config.yaml");
        println!("  5. /etc/fieldstudy/config.yaml");
        match NodeConfigManifest::discover_config() {
            Some(found) => println!("  Using: {}", found.display().to_string().green()),
            None if config_override.is_none() => println!("  Using: {}", "(defaults)".dimmed()),
            None => {}
        }
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    if let Some(version) = &config.metadata.version {
        println!("  Version: {}", version);
    }
    println!();

    let storage = &config.spec.storage;
    println!("{}", "Storage:".bold());
    match storage.backend {
        StorageBackend::InMemory => println!("  Backend: in_memory"),
        StorageBackend::File => {
            println!("  Backend: file");
            println!("  Path: {}", storage.path.display());
            println!("  Codec: {:?}", storage.codec);
        }
    }
    println!();

    println!("{}", "Concurrency:".bold());
    println!(
        "  Max conflict retries: {}",
        config.spec.concurrency.max_conflict_retries
    );
    println!();

    println!("{}", "Events:".bold());
    println!("  Channel capacity: {}", config.spec.events.channel_capacity);
    println!();

    println!("{}", "Observability:".bold());
    println!("  Log level: {}", config.spec.observability.log_level);

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use fieldstudy_core::domain::node_config::{NodeConfigManifest, SnapshotFormat, StorageBackend};

    #[test]
    fn test_templates_are_valid_configs() {
        for template in [
            include_str!("../../templates/config-minimal.yaml"),
            include_str!("../../templates/config-with-examples.yaml"),
        ] {
            let config = NodeConfigManifest::from_yaml_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_example_template_spells_out_every_section() {
        let config =
            NodeConfigManifest::from_yaml_str(include_str!("../../templates/config-with-examples.yaml"))
                .unwrap();
        assert_eq!(config.spec.storage.backend, StorageBackend::File);
        assert_eq!(config.spec.storage.codec, SnapshotFormat::Yaml);
        assert_eq!(config.spec.concurrency.max_conflict_retries, 5);
        assert_eq!(config.spec.events.channel_capacity, 500);
    }
}
