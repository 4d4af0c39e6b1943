// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Study Protocol Domain Model
//!
//! A study protocol describes which devices take part in a study, how they are
//! connected, which tasks they run and which triggers start or stop those
//! tasks. A deployment is instantiated from a protocol and only ever reads it.
//!
//! # Architectural Context
//!
//! - **Bounded Context:** Protocol Design Context
//! - **Aggregate Root:** StudyProtocol
//!
//! # Device Topology
//!
//! Devices form a rooted forest. Roots are primary devices; every connected
//! device points at exactly one parent that was already part of the protocol
//! when the connection was added, so the parent relation cannot contain cycles.
//! Devices and connections are stored in separate maps keyed by role name:
//!
//! ```text
//! devices:     { "Phone" => Smartphone, "Strap" => BleHeartRateDevice }
//! connections: { "Strap" => "Phone" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::device::{DeviceDescriptor, RoleName};

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for a StudyProtocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolId(pub Uuid);

impl ProtocolId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProtocolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a trigger, unique within a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub u32);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects: Tasks and Triggers
// ============================================================================

/// A task devices can run, such as collecting a set of measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data types collected while the task runs (e.g. "heartrate", "geolocation").
    #[serde(default)]
    pub measures: Vec<String>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            measures: Vec::new(),
        }
    }

    pub fn with_measures<I, S>(mut self, measures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.measures = measures.into_iter().map(Into::into).collect();
        self
    }
}

/// Condition, evaluated on a source device, that fires task controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub source_device_role: RoleName,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerKind {
    /// Fires once the given time has passed since the study started on the device.
    ElapsedTime {
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    /// Fires when the participant acts on a prompt.
    Manual {
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// Fires at a time of day ("HH:MM") following a recurrence rule.
    Scheduled {
        time_of_day: String,
        recurrence: String,
    },
}

impl TriggerKind {
    /// Time-based triggers need a device that keeps a study clock.
    pub fn requires_primary_device(&self) -> bool {
        matches!(self, Self::ElapsedTime { .. } | Self::Scheduled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Start,
    Stop,
}

/// Rule: when `trigger_id` fires, `control` the task `task_name` on
/// `destination_device_role`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskControl {
    pub trigger_id: TriggerId,
    pub task_name: String,
    pub destination_device_role: RoleName,
    pub control: Control,
}

// ============================================================================
// Value Objects: Deployment Issues
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    /// The protocol cannot be deployed.
    Error,
    /// The protocol can be deployed but is likely misconfigured.
    Warning,
}

/// Problem found when checking whether a protocol can be deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DeploymentIssue {
    #[error("Protocol has no primary device")]
    NoPrimaryDevice,

    #[error("Trigger {trigger_id} is sourced from unknown device '{device}'")]
    UnknownTriggerSourceDevice { trigger_id: TriggerId, device: RoleName },

    #[error("Trigger {trigger_id} is time-based and must be sourced from a primary device, not '{device}'")]
    TriggerRequiresPrimarySource { trigger_id: TriggerId, device: RoleName },

    #[error("Task control references unknown trigger {trigger_id}")]
    UnknownTaskControlTrigger { trigger_id: TriggerId },

    #[error("Task control references unknown task '{task_name}'")]
    UnknownTaskControlTask { task_name: String },

    #[error("Task control targets unknown device '{device}'")]
    UnknownTaskControlDevice { device: RoleName },

    #[error("Devices not used by any trigger or task control: {devices:?}")]
    UnusedDevices { devices: Vec<RoleName> },

    #[error("Tasks never referenced by a task control: {tasks:?}")]
    UntriggeredTasks { tasks: Vec<String> },

    #[error("Tasks that are stopped but never started: {tasks:?}")]
    UnstartedTasks { tasks: Vec<String> },
}

impl DeploymentIssue {
    pub fn severity(&self) -> IssueSeverity {
        match self {
            Self::UnusedDevices { .. } | Self::UntriggeredTasks { .. } | Self::UnstartedTasks { .. } => {
                IssueSeverity::Warning
            }
            _ => IssueSeverity::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity() == IssueSeverity::Error
    }
}

// ============================================================================
// Aggregate Root: StudyProtocol
// ============================================================================

/// Study protocol aggregate root.
///
/// # Invariants
/// - Role names are unique across all devices
/// - Every connected device has exactly one parent that is part of the protocol
/// - No device is its own ancestor
/// - Task names and trigger ids are unique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyProtocol {
    pub id: ProtocolId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    devices: BTreeMap<RoleName, DeviceDescriptor>,
    /// Connected device -> parent device.
    connections: BTreeMap<RoleName, RoleName>,
    tasks: BTreeMap<String, TaskDescriptor>,
    triggers: BTreeMap<TriggerId, Trigger>,
    task_controls: Vec<TaskControl>,
    pub created_on: DateTime<Utc>,
}

impl StudyProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProtocolId::new(),
            name: name.into(),
            description: None,
            devices: BTreeMap::new(),
            connections: BTreeMap::new(),
            tasks: BTreeMap::new(),
            triggers: BTreeMap::new(),
            task_controls: Vec::new(),
            created_on: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    // ------------------------------------------------------------------------
    // Authoring
    // ------------------------------------------------------------------------

    /// Add a root device which receives its own configuration.
    pub fn add_primary_device(&mut self, device: DeviceDescriptor) -> Result<(), ProtocolError> {
        self.ensure_new_role(&device.role_name)?;
        if !device.is_primary {
            return Err(ProtocolError::NotPrimaryDevice(device.role_name));
        }
        if !device.kind.supports_primary() {
            return Err(ProtocolError::NotPrimaryCapable {
                device: device.role_name,
                kind: device.kind.type_name().to_string(),
            });
        }

        self.devices.insert(device.role_name.clone(), device);
        Ok(())
    }

    /// Connect a device to a parent that is already part of the protocol.
    /// The device may itself be primary, in which case it also receives its own
    /// configuration covering its dependents.
    pub fn add_connected_device(
        &mut self,
        device: DeviceDescriptor,
        parent: &RoleName,
    ) -> Result<(), ProtocolError> {
        self.ensure_new_role(&device.role_name)?;
        if !self.devices.contains_key(parent) {
            return Err(ProtocolError::UnknownParent {
                device: device.role_name,
                parent: parent.clone(),
            });
        }
        if device.is_primary && !device.kind.supports_primary() {
            return Err(ProtocolError::NotPrimaryCapable {
                device: device.role_name,
                kind: device.kind.type_name().to_string(),
            });
        }

        self.connections
            .insert(device.role_name.clone(), parent.clone());
        self.devices.insert(device.role_name.clone(), device);
        Ok(())
    }

    pub fn add_task(&mut self, task: TaskDescriptor) -> Result<(), ProtocolError> {
        if self.tasks.contains_key(&task.name) {
            return Err(ProtocolError::DuplicateTaskName(task.name));
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    /// Add a trigger under the id following the highest one in use. Once
    /// `u32::MAX` is taken, the lowest unused id is picked instead.
    pub fn add_trigger(&mut self, trigger: Trigger) -> Result<TriggerId, ProtocolError> {
        let id = match self.triggers.keys().next_back() {
            None => TriggerId(0),
            Some(last) => match last.0.checked_add(1) {
                Some(next) => TriggerId(next),
                None => self.lowest_free_trigger_id()?,
            },
        };
        self.triggers.insert(id, trigger);
        Ok(id)
    }

    fn lowest_free_trigger_id(&self) -> Result<TriggerId, ProtocolError> {
        let mut candidate: u32 = 0;
        for used in self.triggers.keys() {
            if used.0 != candidate {
                return Ok(TriggerId(candidate));
            }
            candidate = candidate
                .checked_add(1)
                .ok_or(ProtocolError::TriggerIdsExhausted)?;
        }
        Ok(TriggerId(candidate))
    }

    /// Add a trigger under an explicit id (used when loading manifests).
    pub fn insert_trigger(&mut self, id: TriggerId, trigger: Trigger) -> Result<(), ProtocolError> {
        if self.triggers.contains_key(&id) {
            return Err(ProtocolError::DuplicateTriggerId(id));
        }
        self.triggers.insert(id, trigger);
        Ok(())
    }

    /// Record a task control. References are checked by
    /// [`get_deployment_issues`](Self::get_deployment_issues), not here.
    pub fn add_task_control(&mut self, control: TaskControl) {
        if !self.task_controls.contains(&control) {
            self.task_controls.push(control);
        }
    }

    fn ensure_new_role(&self, role: &RoleName) -> Result<(), ProtocolError> {
        if self.devices.contains_key(role) {
            return Err(ProtocolError::DuplicateRoleName(role.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Structural queries
    // ------------------------------------------------------------------------

    pub fn device(&self, role: &RoleName) -> Option<&DeviceDescriptor> {
        self.devices.get(role)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values()
    }

    /// All devices that receive a configuration of their own, in role order.
    pub fn primary_devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.values().filter(|d| d.is_primary)
    }

    /// Devices that hang off a parent device, in role order.
    pub fn connected_devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices
            .values()
            .filter(|d| self.connections.contains_key(&d.role_name))
    }

    /// Root devices of the device forest.
    pub fn root_devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices
            .values()
            .filter(|d| !self.connections.contains_key(&d.role_name))
    }

    pub fn parent_of(&self, role: &RoleName) -> Option<&RoleName> {
        self.connections.get(role)
    }

    pub fn connections(&self) -> &BTreeMap<RoleName, RoleName> {
        &self.connections
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }

    pub fn task(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(name)
    }

    pub fn triggers(&self) -> &BTreeMap<TriggerId, Trigger> {
        &self.triggers
    }

    pub fn task_controls(&self) -> &[TaskControl] {
        &self.task_controls
    }

    /// Devices depending on `role`: direct children, or all transitive
    /// dependents when `recursive` is set. Returned in role order.
    pub fn get_connected_devices(
        &self,
        role: &RoleName,
        recursive: bool,
    ) -> Result<Vec<&DeviceDescriptor>, ProtocolError> {
        if !self.devices.contains_key(role) {
            return Err(ProtocolError::UnknownDevice(role.clone()));
        }

        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([role]);
        while let Some(current) = queue.pop_front() {
            for (child, parent) in &self.connections {
                if parent == current && found.insert(child) && recursive {
                    queue.push_back(child);
                }
            }
        }

        Ok(found
            .into_iter()
            .filter_map(|r| self.devices.get(r))
            .collect())
    }

    /// `role` together with all of its transitive dependents.
    pub fn subtree(&self, role: &RoleName) -> Result<BTreeSet<RoleName>, ProtocolError> {
        let mut roles: BTreeSet<RoleName> = self
            .get_connected_devices(role, true)?
            .into_iter()
            .map(|d| d.role_name.clone())
            .collect();
        roles.insert(role.clone());
        Ok(roles)
    }

    /// Parent chain of `role`, nearest first.
    pub fn ancestors(&self, role: &RoleName) -> Vec<RoleName> {
        let mut chain = Vec::new();
        let mut current = role;
        // Bounded by the device count so a corrupted snapshot cannot loop forever.
        while let Some(parent) = self.connections.get(current) {
            if chain.len() >= self.devices.len() {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }

    // ------------------------------------------------------------------------
    // Deployability
    // ------------------------------------------------------------------------

    /// True iff the protocol has a primary device and all task controls and
    /// triggers reference parts of the protocol.
    pub fn is_deployable(&self) -> bool {
        !self.get_deployment_issues().iter().any(DeploymentIssue::is_error)
    }

    /// Errors and warnings affecting deployment of this protocol.
    pub fn get_deployment_issues(&self) -> Vec<DeploymentIssue> {
        let mut issues = Vec::new();

        if self.primary_devices().next().is_none() {
            issues.push(DeploymentIssue::NoPrimaryDevice);
        }

        for (id, trigger) in &self.triggers {
            match self.devices.get(&trigger.source_device_role) {
                None => issues.push(DeploymentIssue::UnknownTriggerSourceDevice {
                    trigger_id: *id,
                    device: trigger.source_device_role.clone(),
                }),
                Some(source) if trigger.kind.requires_primary_device() && !source.is_primary => {
                    issues.push(DeploymentIssue::TriggerRequiresPrimarySource {
                        trigger_id: *id,
                        device: trigger.source_device_role.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for control in &self.task_controls {
            if !self.triggers.contains_key(&control.trigger_id) {
                issues.push(DeploymentIssue::UnknownTaskControlTrigger {
                    trigger_id: control.trigger_id,
                });
            }
            if !self.tasks.contains_key(&control.task_name) {
                issues.push(DeploymentIssue::UnknownTaskControlTask {
                    task_name: control.task_name.clone(),
                });
            }
            if !self.devices.contains_key(&control.destination_device_role) {
                issues.push(DeploymentIssue::UnknownTaskControlDevice {
                    device: control.destination_device_role.clone(),
                });
            }
        }

        let used: BTreeSet<&RoleName> = self
            .task_controls
            .iter()
            .map(|c| &c.destination_device_role)
            .chain(self.triggers.values().map(|t| &t.source_device_role))
            .collect();
        let unused: Vec<RoleName> = self
            .devices
            .keys()
            .filter(|role| !used.contains(role))
            .cloned()
            .collect();
        if !unused.is_empty() {
            issues.push(DeploymentIssue::UnusedDevices { devices: unused });
        }

        let untriggered: Vec<String> = self
            .tasks
            .keys()
            .filter(|task| !self.task_controls.iter().any(|c| &c.task_name == *task))
            .cloned()
            .collect();
        if !untriggered.is_empty() {
            issues.push(DeploymentIssue::UntriggeredTasks { tasks: untriggered });
        }

        let unstarted: Vec<String> = self
            .tasks
            .keys()
            .filter(|task| {
                let controls: Vec<_> = self
                    .task_controls
                    .iter()
                    .filter(|c| &c.task_name == *task)
                    .collect();
                !controls.is_empty() && controls.iter().all(|c| c.control == Control::Stop)
            })
            .cloned()
            .collect();
        if !unstarted.is_empty() {
            issues.push(DeploymentIssue::UnstartedTasks { tasks: unstarted });
        }

        issues
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid role name: {0}")]
    InvalidRoleName(String),

    #[error("Role name '{0}' is already used in this protocol")]
    DuplicateRoleName(RoleName),

    #[error("Cannot connect '{device}': parent '{parent}' is not part of the protocol")]
    UnknownParent { device: RoleName, parent: RoleName },

    #[error("Device '{0}' is not part of the protocol")]
    UnknownDevice(RoleName),

    #[error("Device '{0}' is not marked as a primary device")]
    NotPrimaryDevice(RoleName),

    #[error("Device '{device}' of kind {kind} cannot act as a primary device")]
    NotPrimaryCapable { device: RoleName, kind: String },

    #[error("Task '{0}' is already part of the protocol")]
    DuplicateTaskName(String),

    #[error("Trigger id {0} is already in use")]
    DuplicateTriggerId(TriggerId),

    #[error("No unused trigger id is left")]
    TriggerIdsExhausted,
}
