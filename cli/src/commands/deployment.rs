// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Study deployment commands
//!
//! Commands: create, status, list, stop

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use fieldstudy_core::application::{DeploymentService, DeploymentServiceError};
use fieldstudy_core::domain::deployment::DeploymentId;

use super::print_status;
use super::protocol::load_manifest;
use crate::embedded::EmbeddedRuntime;

#[derive(Subcommand)]
pub enum DeploymentCommand {
    /// Create a deployment from a protocol manifest
    Create {
        /// Path to protocol manifest YAML file
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },

    /// Show deployment and per-device status
    Status {
        /// Deployment ID
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: DeploymentId,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List deployments
    List,

    /// Stop a deployment (terminal)
    Stop {
        /// Deployment ID
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: DeploymentId,
    },
}

pub async fn handle_command(command: DeploymentCommand, config_path: Option<PathBuf>) -> Result<()> {
    let runtime = EmbeddedRuntime::new(config_path).await?;
    let service = runtime.service();

    match command {
        DeploymentCommand::Create { manifest } => {
            let protocol = load_manifest(&manifest)?;
            let name = protocol.name.clone();
            let id = match service.create_deployment(protocol).await {
                Ok(id) => id,
                Err(DeploymentServiceError::InvalidProtocol(issues)) => {
                    for issue in issues.iter().filter(|i| i.is_error()) {
                        println!("{} {}", "error:".red().bold(), issue);
                    }
                    anyhow::bail!("Protocol '{}' cannot be deployed", name);
                }
                Err(e) => return Err(e).context("Failed to create deployment"),
            };

            println!("{}", format!("✓ Deployment created for '{}'", name).green());
            println!("{}", id);
            Ok(())
        }
        DeploymentCommand::Status {
            deployment_id,
            json,
        } => {
            let status = service
                .get_deployment_status(deployment_id)
                .await
                .context("Failed to get deployment status")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        DeploymentCommand::List => {
            let deployments = service
                .list_deployments()
                .await
                .context("Failed to list deployments")?;

            if deployments.is_empty() {
                println!("{}", "No deployments found".yellow());
                return Ok(());
            }

            println!("{} deployments found:", deployments.len());
            println!("{:<38} {:<24} {:<18} {}", "ID", "PROTOCOL", "STATE", "CREATED");
            for status in deployments {
                println!(
                    "{:<38} {:<24} {:<18} {}",
                    status.deployment_id.to_string(),
                    status.protocol_name.bold(),
                    status.state.to_string(),
                    status.created_on.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        DeploymentCommand::Stop { deployment_id } => {
            service
                .stop(deployment_id)
                .await
                .context("Failed to stop deployment")?;
            println!("{}", format!("✓ Deployment {} stopped", deployment_id).green());
            Ok(())
        }
    }
}
