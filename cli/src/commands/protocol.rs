// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Protocol manifest commands
//!
//! Commands: validate, show

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use fieldstudy_core::domain::device::DeviceDescriptor;
use fieldstudy_core::domain::protocol::{IssueSeverity, StudyProtocol};
use fieldstudy_core::infrastructure::protocol_parser::ProtocolParser;

#[derive(Subcommand)]
pub enum ProtocolCommand {
    /// Parse a protocol manifest and report deployment issues
    Validate {
        /// Path to protocol manifest YAML file
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },

    /// Print the device tree of a protocol manifest
    Show {
        /// Path to protocol manifest YAML file
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },
}

pub async fn handle_command(command: ProtocolCommand) -> Result<()> {
    match command {
        ProtocolCommand::Validate { manifest } => validate(manifest).await,
        ProtocolCommand::Show { manifest } => show(manifest).await,
    }
}

pub(crate) fn load_manifest(manifest: &Path) -> Result<StudyProtocol> {
    ProtocolParser::parse_file(manifest)
        .with_context(|| format!("Failed to parse protocol manifest {:?}", manifest))
}

async fn validate(manifest: PathBuf) -> Result<()> {
    let protocol = load_manifest(&manifest)?;
    let issues = protocol.get_deployment_issues();

    for issue in &issues {
        match issue.severity() {
            IssueSeverity::Error => println!("{} {}", "error:".red().bold(), issue),
            IssueSeverity::Warning => println!("{} {}", "warning:".yellow().bold(), issue),
        }
    }

    if protocol.is_deployable() {
        println!(
            "{}",
            format!("✓ Protocol '{}' can be deployed", protocol.name).green()
        );
        Ok(())
    } else {
        anyhow::bail!("Protocol '{}' cannot be deployed", protocol.name)
    }
}

async fn show(manifest: PathBuf) -> Result<()> {
    let protocol = load_manifest(&manifest)?;

    println!("{} {}", "Protocol:".bold(), protocol.name);
    if let Some(description) = &protocol.description {
        println!("  {}", description.dimmed());
    }
    println!();

    for root in protocol.root_devices() {
        print_device(&protocol, root, 0);
    }
    println!();

    println!("{}", "Task controls:".bold());
    for control in protocol.task_controls() {
        println!(
            "  trigger {} → {:?} '{}' on {}",
            control.trigger_id, control.control, control.task_name, control.destination_device_role
        );
    }

    Ok(())
}

fn print_device(protocol: &StudyProtocol, device: &DeviceDescriptor, depth: usize) {
    let marker = if device.is_primary { "*" } else { "-" };
    let optional = if device.is_optional { " (optional)" } else { "" };
    println!(
        "{}{} {} [{}]{}",
        "  ".repeat(depth + 1),
        marker,
        device.role_name.as_str().bold(),
        device.kind.type_name(),
        optional
    );

    if let Ok(children) = protocol.get_connected_devices(&device.role_name, false) {
        for child in children {
            print_device(protocol, child, depth + 1);
        }
    }
}
