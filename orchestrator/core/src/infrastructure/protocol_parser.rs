// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Study Protocol YAML Parser
//!
//! This module provides infrastructure for parsing study protocol manifests
//! into domain objects.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Parse external YAML → Domain objects
//! - **Anti-Corruption:** Translates YAML schema to domain model
//!
//! # Manifest Format
//!
//! ```yaml
//! apiVersion: fieldstudy.io/v1
//! kind: StudyProtocol
//! metadata:
//!   name: phone-sensor
//! spec:
//!   devices:
//!     - roleName: Phone
//!       type: Smartphone
//!       primary: true
//!     - roleName: Sensor
//!       type: BleHeartRateDevice
//!       connectedTo: Phone
//!   tasks:
//!     - name: Monitor
//!       measures: [heartrate]
//!   triggers:
//!     - id: 0
//!       sourceDevice: Phone
//!       type: ElapsedTime
//!       elapsed: 0s
//!   taskControls:
//!     - trigger: 0
//!       task: Monitor
//!       destinationDevice: Sensor
//!       control: start
//! ```
//!
//! Devices may appear in any order; they are inserted parent-first. A device
//! whose parent never becomes available (missing or part of a cycle) is
//! reported as an unknown parent.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::domain::device::{DeviceDescriptor, DeviceKind, RoleName};
use crate::domain::protocol::{
    Control, ProtocolError, StudyProtocol, TaskControl, TaskDescriptor, Trigger, TriggerId, TriggerKind,
};

pub const API_VERSION: &str = "fieldstudy.io/v1";
pub const KIND: &str = "StudyProtocol";

// ============================================================================
// YAML Schema (External Representation)
// ============================================================================

/// External YAML representation of a study protocol manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ProtocolMetadataYaml,
    pub spec: ProtocolSpecYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMetadataYaml {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSpecYaml {
    pub devices: Vec<DeviceYaml>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskYaml>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerYaml>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_controls: Vec<TaskControlYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceYaml {
    pub role_name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_to: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub default_sampling: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskYaml {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerYaml {
    /// Assigned sequentially when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub source_device: String,
    #[serde(flatten)]
    pub kind: TriggerKindYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerKindYaml {
    ElapsedTime {
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    Manual {
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Scheduled {
        #[serde(rename = "timeOfDay")]
        time_of_day: String,
        recurrence: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskControlYaml {
    pub trigger: u32,
    pub task: String,
    pub destination_device: String,
    pub control: Control,
}

// ============================================================================
// Parser
// ============================================================================

/// Study protocol parser (Infrastructure service)
pub struct ProtocolParser;

impl ProtocolParser {
    /// Parse a protocol manifest from YAML file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<StudyProtocol, ProtocolParseError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ProtocolParseError::IoError {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        Self::parse_yaml(&content)
    }

    /// Parse a protocol manifest from YAML string
    pub fn parse_yaml(yaml: &str) -> Result<StudyProtocol, ProtocolParseError> {
        let manifest: ProtocolManifest =
            serde_yaml::from_str(yaml).map_err(|e| ProtocolParseError::YamlError(e.to_string()))?;

        Self::validate_and_convert(manifest)
    }

    /// Validate manifest and convert to domain object
    fn validate_and_convert(manifest: ProtocolManifest) -> Result<StudyProtocol, ProtocolParseError> {
        if manifest.api_version != API_VERSION {
            return Err(ProtocolParseError::InvalidApiVersion {
                expected: API_VERSION.to_string(),
                got: manifest.api_version,
            });
        }

        if manifest.kind != KIND {
            return Err(ProtocolParseError::InvalidKind {
                expected: KIND.to_string(),
                got: manifest.kind,
            });
        }

        if manifest.metadata.name.trim().is_empty() {
            return Err(ProtocolParseError::ValidationError(
                "metadata.name cannot be empty".to_string(),
            ));
        }

        let mut protocol = StudyProtocol::new(manifest.metadata.name);
        if let Some(description) = manifest.metadata.description {
            protocol = protocol.with_description(description);
        }

        Self::insert_devices(&mut protocol, manifest.spec.devices)?;

        for task in manifest.spec.tasks {
            let mut descriptor = TaskDescriptor::new(task.name).with_measures(task.measures);
            descriptor.description = task.description;
            protocol.add_task(descriptor)?;
        }

        for trigger in manifest.spec.triggers {
            let converted = Trigger {
                source_device_role: RoleName::new(trigger.source_device)?,
                kind: Self::convert_trigger_kind(trigger.kind),
            };
            match trigger.id {
                Some(id) => protocol.insert_trigger(TriggerId(id), converted)?,
                None => {
                    protocol.add_trigger(converted)?;
                }
            }
        }

        for control in manifest.spec.task_controls {
            protocol.add_task_control(TaskControl {
                trigger_id: TriggerId(control.trigger),
                task_name: control.task,
                destination_device_role: RoleName::new(control.destination_device)?,
                control: control.control,
            });
        }

        Ok(protocol)
    }

    /// Insert devices so that every parent precedes its children.
    fn insert_devices(protocol: &mut StudyProtocol, devices: Vec<DeviceYaml>) -> Result<(), ProtocolParseError> {
        let mut children: Vec<(DeviceDescriptor, RoleName)> = Vec::new();
        for device in devices {
            let role_name = RoleName::new(device.role_name)?;
            let kind = DeviceKind::from_type_name(&device.device_type);
            let mut descriptor = if device.primary {
                DeviceDescriptor::primary(role_name, kind)
            } else {
                DeviceDescriptor::connected(role_name, kind)
            };
            descriptor.is_optional = device.optional;
            descriptor.default_sampling = device.default_sampling;

            match device.connected_to {
                None => protocol.add_primary_device(descriptor)?,
                Some(parent) => children.push((descriptor, RoleName::new(parent)?)),
            }
        }

        while !children.is_empty() {
            let before = children.len();
            let mut waiting = Vec::new();
            for (descriptor, parent) in children {
                if protocol.device(&parent).is_some() {
                    protocol.add_connected_device(descriptor, &parent)?;
                } else {
                    waiting.push((descriptor, parent));
                }
            }
            children = waiting;

            // No progress: the parent is missing or part of a cycle.
            if children.len() == before {
                let (device, parent) = children.swap_remove(0);
                return Err(ProtocolError::UnknownParent {
                    device: device.role_name,
                    parent,
                }
                .into());
            }
        }

        Ok(())
    }

    fn convert_trigger_kind(yaml: TriggerKindYaml) -> TriggerKind {
        match yaml {
            TriggerKindYaml::ElapsedTime { elapsed } => TriggerKind::ElapsedTime { elapsed },
            TriggerKindYaml::Manual { label, description } => TriggerKind::Manual { label, description },
            TriggerKindYaml::Scheduled {
                time_of_day,
                recurrence,
            } => TriggerKind::Scheduled {
                time_of_day,
                recurrence,
            },
        }
    }

    /// Serialize a protocol back to YAML
    pub fn to_yaml(protocol: &StudyProtocol) -> Result<String, ProtocolParseError> {
        let manifest = Self::protocol_to_manifest(protocol);
        serde_yaml::to_string(&manifest).map_err(|e| ProtocolParseError::YamlError(e.to_string()))
    }

    fn protocol_to_manifest(protocol: &StudyProtocol) -> ProtocolManifest {
        let devices = protocol
            .devices()
            .map(|d| DeviceYaml {
                role_name: d.role_name.to_string(),
                device_type: d.kind.type_name().to_string(),
                primary: d.is_primary,
                optional: d.is_optional,
                connected_to: protocol.parent_of(&d.role_name).map(ToString::to_string),
                default_sampling: d.default_sampling.clone(),
            })
            .collect();

        let tasks = protocol
            .tasks()
            .map(|t| TaskYaml {
                name: t.name.clone(),
                description: t.description.clone(),
                measures: t.measures.clone(),
            })
            .collect();

        let triggers = protocol
            .triggers()
            .iter()
            .map(|(id, t)| TriggerYaml {
                id: Some(id.0),
                source_device: t.source_device_role.to_string(),
                kind: match &t.kind {
                    TriggerKind::ElapsedTime { elapsed } => TriggerKindYaml::ElapsedTime { elapsed: *elapsed },
                    TriggerKind::Manual { label, description } => TriggerKindYaml::Manual {
                        label: label.clone(),
                        description: description.clone(),
                    },
                    TriggerKind::Scheduled {
                        time_of_day,
                        recurrence,
                    } => TriggerKindYaml::Scheduled {
                        time_of_day: time_of_day.clone(),
                        recurrence: recurrence.clone(),
                    },
                },
            })
            .collect();

        let task_controls = protocol
            .task_controls()
            .iter()
            .map(|c| TaskControlYaml {
                trigger: c.trigger_id.0,
                task: c.task_name.clone(),
                destination_device: c.destination_device_role.to_string(),
                control: c.control,
            })
            .collect();

        ProtocolManifest {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ProtocolMetadataYaml {
                name: protocol.name.clone(),
                description: protocol.description.clone(),
            },
            spec: ProtocolSpecYaml {
                devices,
                tasks,
                triggers,
                task_controls,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolParseError {
    #[error("IO error reading {path}: {error}")]
    IoError { path: String, error: String },

    #[error("YAML parse error: {0}")]
    YamlError(String),

    #[error("Invalid API version: expected '{expected}', got '{got}'")]
    InvalidApiVersion { expected: String, got: String },

    #[error("Invalid kind: expected '{expected}', got '{got}'")]
    InvalidKind { expected: String, got: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid protocol: {0}")]
    Protocol(#[from] ProtocolError),
}
