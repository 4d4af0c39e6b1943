// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the fieldstudy CLI

pub mod config;
pub mod deployment;
pub mod device;
pub mod protocol;

pub use self::config::ConfigCommand;
pub use self::deployment::DeploymentCommand;
pub use self::device::DeviceCommand;
pub use self::protocol::ProtocolCommand;

use colored::Colorize;
use fieldstudy_core::domain::deployment::{DeploymentState, DeviceDeploymentState, StudyDeploymentStatus};
use fieldstudy_core::domain::events::DeploymentEvent;

/// Print an aggregate status with one line per device.
pub(crate) fn print_status(status: &StudyDeploymentStatus) {
    println!("{} {}", "Deployment:".bold(), status.deployment_id);
    println!("  Protocol: {}", status.protocol_name);
    println!("  State:    {}", colorize_state(status.state));
    println!("  Created:  {}", status.created_on.to_rfc3339());
    if let Some(ready_on) = status.ready_on {
        println!("  Ready:    {}", ready_on.to_rfc3339());
    }
    if let Some(stopped_on) = status.stopped_on {
        println!("  Stopped:  {}", stopped_on.to_rfc3339());
    }
    println!();

    println!("{:<28} {:<10} {:<20} {}", "ROLE", "PRIMARY", "STATE", "WAITING FOR");
    for device in &status.devices {
        let primary = match (device.is_primary, device.is_optional) {
            (true, true) => "optional",
            (true, false) => "yes",
            (false, _) => "-",
        };
        let waiting = if device.remaining_devices_to_register.is_empty() {
            String::new()
        } else {
            device
                .remaining_devices_to_register
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "{:<28} {:<10} {:<20} {}",
            device.role_name.as_str().bold(),
            primary,
            colorize_device_state(device.state),
            waiting.dimmed()
        );
    }
}

fn colorize_state(state: DeploymentState) -> colored::ColoredString {
    let label = state.to_string();
    match state {
        DeploymentState::Invited => label.normal(),
        DeploymentState::DeployingDevices => label.yellow(),
        DeploymentState::DeploymentReady => label.green(),
        DeploymentState::Stopped => label.red(),
    }
}

fn colorize_device_state(state: DeviceDeploymentState) -> colored::ColoredString {
    match state {
        DeviceDeploymentState::Unregistered => "unregistered".dimmed(),
        DeviceDeploymentState::Registered => "registered".normal(),
        DeviceDeploymentState::Deployed => "deployed".green(),
        DeviceDeploymentState::NeedsRedeployment => "needs redeployment".yellow(),
    }
}

/// Print domain events in publication order.
pub(crate) fn print_events(events: &[DeploymentEvent]) {
    println!();
    println!("{}", "Events:".bold());
    if events.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for event in events {
        match event.role_name() {
            Some(role) => println!("  {} {}", event.name().cyan(), role),
            None => println!("  {}", event.name().cyan()),
        }
    }
}
