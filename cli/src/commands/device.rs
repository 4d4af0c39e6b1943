// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-device commands
//!
//! Commands: register, unregister, deployment, confirm

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use std::path::{Path, PathBuf};

use fieldstudy_core::application::{DeploymentService, StandardDeploymentService};
use fieldstudy_core::domain::consistency::Fingerprint;
use fieldstudy_core::domain::deployment::DeploymentId;
use fieldstudy_core::domain::device::{DeviceRegistration, RegistrationDetails, RoleName};
use fieldstudy_core::domain::events::DeploymentEvent;

use super::{print_events, print_status};
use crate::embedded::EmbeddedRuntime;

#[derive(Subcommand)]
pub enum DeviceCommand {
    /// Register a device for a role
    Register {
        /// Deployment ID
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: DeploymentId,

        /// Role name from the protocol
        #[arg(value_name = "ROLE")]
        role: RoleName,

        #[command(flatten)]
        registration: RegistrationArgs,

        /// Replace the registration the role currently holds
        #[arg(long)]
        replace: bool,
    },

    /// Remove the registration held by a role
    Unregister {
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: DeploymentId,

        #[arg(value_name = "ROLE")]
        role: RoleName,
    },

    /// Fetch the configuration of a primary device
    Deployment {
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: DeploymentId,

        #[arg(value_name = "ROLE")]
        role: RoleName,

        /// Write the configuration to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Confirm that a primary device applied a configuration
    Confirm {
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: DeploymentId,

        #[arg(value_name = "ROLE")]
        role: RoleName,

        /// Fingerprint printed by `device deployment`
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: String,
    },
}

impl DeviceCommand {
    pub fn deployment_id(&self) -> DeploymentId {
        match self {
            Self::Register { deployment_id, .. }
            | Self::Unregister { deployment_id, .. }
            | Self::Deployment { deployment_id, .. }
            | Self::Confirm { deployment_id, .. } => *deployment_id,
        }
    }
}

/// Registration either read from a file or assembled from flags.
#[derive(Args, Debug, Default)]
pub struct RegistrationArgs {
    /// Registration YAML/JSON file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["device_id", "display_name", "mac_address"])]
    pub registration: Option<PathBuf>,

    /// Device identifier
    #[arg(long, required_unless_present = "registration")]
    pub device_id: Option<String>,

    /// Human-readable device name
    #[arg(long)]
    pub display_name: Option<String>,

    /// MAC address, for devices registered by hardware address
    #[arg(long)]
    pub mac_address: Option<String>,
}

impl RegistrationArgs {
    pub fn to_registration(&self) -> Result<DeviceRegistration> {
        if let Some(path) = &self.registration {
            return read_registration(path);
        }

        let device_id = self
            .device_id
            .clone()
            .context("Either --registration or --device-id is required")?;
        let mut registration = DeviceRegistration::new(device_id);
        if let Some(name) = &self.display_name {
            registration = registration.with_display_name(name);
        }
        if let Some(mac_address) = &self.mac_address {
            registration = registration.with_details(RegistrationDetails::MacAddress {
                mac_address: mac_address.clone(),
            });
        }
        Ok(registration)
    }
}

fn read_registration(path: &Path) -> Result<DeviceRegistration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read registration: {:?}", path))?;
    // YAML is a superset of JSON, so one parser covers both.
    serde_yaml::from_str(&content).context("Failed to parse registration")
}

pub async fn handle_command(
    command: DeviceCommand,
    show_events: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let runtime = EmbeddedRuntime::new(config_path).await?;
    let (result, events) = run_observed(runtime, command, show_events).await;
    if let Some(events) = events {
        print_events(&events);
    }
    result
}

/// Run `command`, optionally capturing the events it publishes. The event
/// stream ends once the runtime, and with it the event bus, is dropped.
async fn run_observed(
    runtime: EmbeddedRuntime,
    command: DeviceCommand,
    capture_events: bool,
) -> (Result<()>, Option<Vec<DeploymentEvent>>) {
    let stream = capture_events.then(|| {
        runtime
            .service()
            .event_bus()
            .subscribe_deployment(command.deployment_id())
            .into_stream()
    });

    let result = execute(runtime.service(), command).await;
    drop(runtime);

    let events = match stream {
        Some(stream) => Some(stream.collect().await),
        None => None,
    };
    (result, events)
}

async fn execute(service: &StandardDeploymentService, command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::Register {
            deployment_id,
            role,
            registration,
            replace,
        } => {
            let registration = registration.to_registration()?;
            let device_id = registration.device_id.clone();
            let result = if replace {
                service
                    .replace_device_registration(deployment_id, &role, registration)
                    .await
            } else {
                service.register_device(deployment_id, &role, registration).await
            };
            let status =
                result.with_context(|| format!("Failed to register device for role '{}'", role))?;

            println!(
                "{}",
                format!("✓ Device '{}' registered as '{}'", device_id, role).green()
            );
            println!();
            print_status(&status);
            Ok(())
        }
        DeviceCommand::Unregister {
            deployment_id,
            role,
        } => {
            let status = service
                .unregister_device(deployment_id, &role)
                .await
                .with_context(|| format!("Failed to unregister role '{}'", role))?;
            println!("{}", format!("✓ Role '{}' unregistered", role).green());
            println!();
            print_status(&status);
            Ok(())
        }
        DeviceCommand::Deployment {
            deployment_id,
            role,
            output,
        } => {
            let issued = service
                .get_device_deployment(deployment_id, &role)
                .await
                .with_context(|| format!("Failed to get configuration for '{}'", role))?;
            let json = serde_json::to_string_pretty(&issued.deployment)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write configuration to {:?}", path))?;
                    eprintln!(
                        "{}",
                        format!("✓ Configuration written to {}", path.display()).green()
                    );
                }
                None => println!("{}", json),
            }
            eprintln!("{} {}", "Fingerprint:".bold(), issued.fingerprint);
            Ok(())
        }
        DeviceCommand::Confirm {
            deployment_id,
            role,
            fingerprint,
        } => {
            let status = service
                .confirm_device_deployment(deployment_id, &role, &Fingerprint::new(fingerprint))
                .await
                .with_context(|| format!("Failed to confirm deployment of '{}'", role))?;
            println!("{}", format!("✓ '{}' deployed", role).green());
            println!();
            print_status(&status);
            Ok(())
        }
    }
}
