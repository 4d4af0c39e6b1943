// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Study Deployment Domain Model
//!
//! A study deployment is one running instantiation of a [`StudyProtocol`]. It
//! tracks which device roles hold a registration, which configuration was
//! last handed to each primary device, and whether that configuration has
//! been confirmed or has gone stale since.
//!
//! # Architectural Context
//!
//! - **Bounded Context:** Deployment Context
//! - **Aggregate Root:** StudyDeployment
//!
//! # Device States
//!
//! ```text
//!                register                 issue + confirm(F)
//! Unregistered ───────────▶ Registered ─────────────────────▶ Deployed
//!      ▲                        ▲                                │
//!      │ unregister             │ confirm(F')                    │ subtree registration
//!      └────────────────────────┴──────── NeedsRedeployment ◀────┘ added/replaced/removed
//! ```
//!
//! Connected devices that are not primary only ever report `Unregistered`
//! or `Registered`. The aggregate status (`Invited`, `DeployingDevices`,
//! `DeploymentReady`, `Stopped`) is derived from the per-device states on
//! every query and never stored.
//!
//! Every mutating method validates completely before touching any state, so a
//! failed call leaves the aggregate unchanged. Successful mutations append
//! [`DeploymentEvent`]s which the application layer drains after saving.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::domain::consistency::{
    compute_fingerprint, validate_registration, DeviceCapabilityProvider, Fingerprint,
};
use crate::domain::device::{DeviceDescriptor, DeviceRegistration, RoleName};
use crate::domain::events::DeploymentEvent;
use crate::domain::protocol::{
    DeploymentIssue, StudyProtocol, TaskControl, TaskDescriptor, Trigger, TriggerId,
};

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for a StudyDeployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(pub Uuid);

impl DeploymentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for DeploymentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects: Status
// ============================================================================

/// Configuration bookkeeping for one primary device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDeploymentRecord {
    /// Fingerprint of the configuration most recently handed out. Cleared
    /// whenever the device's subtree changes.
    pub last_issued: Option<Fingerprint>,
    pub last_issued_on: Option<DateTime<Utc>>,
    /// Fingerprint the device confirmed it applied.
    pub deployed: Option<Fingerprint>,
    pub deployed_on: Option<DateTime<Utc>>,
    /// Set when the subtree changed after `deployed` was confirmed.
    pub needs_redeployment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceDeploymentState {
    Unregistered,
    Registered,
    Deployed,
    NeedsRedeployment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDeploymentStatus {
    pub role_name: RoleName,
    pub is_primary: bool,
    pub is_optional: bool,
    pub state: DeviceDeploymentState,
    /// Whether a configuration can be issued right now (primary devices only).
    pub can_obtain_deployment: bool,
    /// Devices that still need a registration before this device's
    /// configuration can be issued (for connected devices: the device itself).
    pub remaining_devices_to_register: Vec<RoleName>,
    pub deployed_fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    /// Created, no device registered yet.
    Invited,
    /// Registrations exist but not every required primary device is deployed.
    DeployingDevices,
    /// Every required primary device runs an up-to-date configuration.
    DeploymentReady,
    /// Terminal.
    Stopped,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Invited => "Invited",
            Self::DeployingDevices => "DeployingDevices",
            Self::DeploymentReady => "DeploymentReady",
            Self::Stopped => "Stopped",
        };
        write!(f, "{}", label)
    }
}

/// Point-in-time view of a deployment, computed from the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDeploymentStatus {
    pub deployment_id: DeploymentId,
    pub protocol_name: String,
    pub state: DeploymentState,
    pub devices: Vec<DeviceDeploymentStatus>,
    pub created_on: DateTime<Utc>,
    pub ready_on: Option<DateTime<Utc>>,
    pub stopped_on: Option<DateTime<Utc>>,
}

impl StudyDeploymentStatus {
    pub fn device(&self, role: &str) -> Option<&DeviceDeploymentStatus> {
        self.devices.iter().find(|d| d.role_name.as_str() == role)
    }

    /// Primary devices that can fetch a (new) configuration now.
    pub fn devices_ready_for_deployment(&self) -> Vec<&RoleName> {
        self.devices
            .iter()
            .filter(|d| {
                d.can_obtain_deployment
                    && matches!(
                        d.state,
                        DeviceDeploymentState::Registered | DeviceDeploymentState::NeedsRedeployment
                    )
            })
            .map(|d| &d.role_name)
            .collect()
    }
}

// ============================================================================
// Value Objects: Issued Configuration
// ============================================================================

/// Everything a primary device needs to run its part of the study: its own
/// registration, its dependents and their registrations, and the task
/// controls aimed at its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryDeviceDeployment {
    pub deployment_id: DeploymentId,
    pub device: DeviceDescriptor,
    pub registration: DeviceRegistration,
    pub connected_devices: Vec<DeviceDescriptor>,
    /// Connected device -> parent device, for every dependent.
    pub connections: BTreeMap<RoleName, RoleName>,
    pub connected_device_registrations: BTreeMap<RoleName, DeviceRegistration>,
    pub tasks: Vec<TaskDescriptor>,
    pub triggers: BTreeMap<TriggerId, Trigger>,
    pub task_controls: Vec<TaskControl>,
}

impl PrimaryDeviceDeployment {
    pub fn role_name(&self) -> &RoleName {
        &self.device.role_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedDeviceDeployment {
    pub deployment: PrimaryDeviceDeployment,
    pub fingerprint: Fingerprint,
}

// ============================================================================
// Aggregate Root: StudyDeployment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Lifecycle {
    Running,
    Stopped,
}

/// Study deployment aggregate root.
///
/// # Invariants
/// - Only deployable protocols are ever instantiated
/// - No two roles hold registrations with the same `device_id`
/// - A configuration is issued only when the primary's whole subtree is registered
/// - Once stopped, no further mutation is accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDeployment {
    pub id: DeploymentId,
    protocol: StudyProtocol,
    registered_devices: BTreeMap<RoleName, DeviceRegistration>,
    /// Every registration ever accepted per role, oldest first.
    registration_history: BTreeMap<RoleName, Vec<DeviceRegistration>>,
    device_deployments: BTreeMap<RoleName, DeviceDeploymentRecord>,
    lifecycle: Lifecycle,
    pub created_on: DateTime<Utc>,
    ready_on: Option<DateTime<Utc>>,
    stopped_on: Option<DateTime<Utc>>,
    #[serde(skip)]
    pending_events: Vec<DeploymentEvent>,
}

impl StudyDeployment {
    /// Instantiate a deployment from a protocol snapshot.
    pub fn new(protocol: StudyProtocol) -> Result<Self, DeploymentError> {
        Self::with_id(DeploymentId::new(), protocol)
    }

    pub fn with_id(id: DeploymentId, protocol: StudyProtocol) -> Result<Self, DeploymentError> {
        let errors: Vec<DeploymentIssue> = protocol
            .get_deployment_issues()
            .into_iter()
            .filter(DeploymentIssue::is_error)
            .collect();
        if !errors.is_empty() {
            return Err(DeploymentError::ProtocolNotDeployable(errors));
        }

        let device_deployments = protocol
            .primary_devices()
            .map(|d| (d.role_name.clone(), DeviceDeploymentRecord::default()))
            .collect();
        let now = Utc::now();
        let protocol_name = protocol.name.clone();

        let mut deployment = Self {
            id,
            protocol,
            registered_devices: BTreeMap::new(),
            registration_history: BTreeMap::new(),
            device_deployments,
            lifecycle: Lifecycle::Running,
            created_on: now,
            ready_on: None,
            stopped_on: None,
            pending_events: Vec::new(),
        };
        deployment.record(DeploymentEvent::DeploymentCreated {
            deployment_id: id,
            protocol_name: protocol_name.clone(),
            created_at: now,
        });

        info!(deployment_id = %id, protocol = %protocol_name, "Study deployment created");
        Ok(deployment)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn protocol(&self) -> &StudyProtocol {
        &self.protocol
    }

    pub fn registered_devices(&self) -> &BTreeMap<RoleName, DeviceRegistration> {
        &self.registered_devices
    }

    pub fn registration(&self, role: &RoleName) -> Option<&DeviceRegistration> {
        self.registered_devices.get(role)
    }

    pub fn registration_history(&self, role: &RoleName) -> &[DeviceRegistration] {
        self.registration_history
            .get(role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn device_record(&self, role: &RoleName) -> Option<&DeviceDeploymentRecord> {
        self.device_deployments.get(role)
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle == Lifecycle::Stopped
    }

    pub fn ready_on(&self) -> Option<DateTime<Utc>> {
        self.ready_on
    }

    pub fn stopped_on(&self) -> Option<DateTime<Utc>> {
        self.stopped_on
    }

    pub fn pending_events(&self) -> &[DeploymentEvent] {
        &self.pending_events
    }

    /// Drain the events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<DeploymentEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // ------------------------------------------------------------------------
    // Device registry
    // ------------------------------------------------------------------------

    /// Record the registration of a device for `role`.
    ///
    /// Fails when the role is unknown, already holds a registration (an
    /// explicit unregister or [`replace_registration`](Self::replace_registration)
    /// is required), the device id is taken by another role, or the
    /// registration is invalid for the device.
    pub fn register_device(
        &mut self,
        capabilities: &dyn DeviceCapabilityProvider,
        role: &RoleName,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.ensure_running()?;
        let device = self.known_device(role)?;
        if self.registered_devices.contains_key(role) {
            return Err(DeploymentError::AlreadyRegistered(role.clone()));
        }
        self.ensure_unique_device_id(role, &registration)?;
        validate_registration(capabilities, device, &registration)?;

        self.apply_registration(role, registration, false);
        Ok(self.get_status())
    }

    /// Swap the registration held by `role` for a new one. Replacing a
    /// registration with an identical one is a no-op.
    pub fn replace_registration(
        &mut self,
        capabilities: &dyn DeviceCapabilityProvider,
        role: &RoleName,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.ensure_running()?;
        let device = self.known_device(role)?;
        let current = self
            .registered_devices
            .get(role)
            .ok_or_else(|| DeploymentError::NotRegistered(role.clone()))?;
        if current == &registration {
            return Ok(self.get_status());
        }
        self.ensure_unique_device_id(role, &registration)?;
        validate_registration(capabilities, device, &registration)?;

        self.apply_registration(role, registration, true);
        Ok(self.get_status())
    }

    /// Remove the registration held by `role`. Configurations of primary
    /// devices depending on it become stale.
    pub fn unregister_device(&mut self, role: &RoleName) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.ensure_running()?;
        self.known_device(role)?;
        if !self.registered_devices.contains_key(role) {
            return Err(DeploymentError::NotRegistered(role.clone()));
        }

        let was_ready = self.is_ready();
        self.registered_devices.remove(role);
        if let Some(record) = self.device_deployments.get_mut(role) {
            *record = DeviceDeploymentRecord::default();
        }
        self.record(DeploymentEvent::DeviceUnregistered {
            deployment_id: self.id,
            role_name: role.clone(),
            unregistered_at: Utc::now(),
        });
        self.invalidate_configurations_covering(role, false);
        self.track_readiness(was_ready);

        info!(deployment_id = %self.id, role = %role, "Device unregistered");
        Ok(self.get_status())
    }

    fn apply_registration(&mut self, role: &RoleName, registration: DeviceRegistration, replaced: bool) {
        let was_ready = self.is_ready();
        let device_id = registration.device_id.clone();

        self.registration_history
            .entry(role.clone())
            .or_default()
            .push(registration.clone());
        self.registered_devices.insert(role.clone(), registration);
        self.record(DeploymentEvent::DeviceRegistered {
            deployment_id: self.id,
            role_name: role.clone(),
            device_id: device_id.clone(),
            replaced,
            registered_at: Utc::now(),
        });
        self.invalidate_configurations_covering(role, true);
        self.track_readiness(was_ready);

        info!(deployment_id = %self.id, role = %role, device_id = %device_id, replaced, "Device registered");
    }

    fn ensure_unique_device_id(
        &self,
        role: &RoleName,
        registration: &DeviceRegistration,
    ) -> Result<(), DeploymentError> {
        let taken_by = self
            .registered_devices
            .iter()
            .find(|(other, existing)| *other != role && existing.device_id == registration.device_id);

        match taken_by {
            Some((other, _)) => Err(DeploymentError::DuplicateDeviceId {
                device_id: registration.device_id.clone(),
                registered_to: other.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Clear issued configurations of every primary device whose subtree
    /// contains `role`, and flag deployed ones for redeployment.
    fn invalidate_configurations_covering(&mut self, role: &RoleName, include_self: bool) {
        let mut affected: Vec<RoleName> = Vec::new();
        if include_self && self.device_deployments.contains_key(role) {
            affected.push(role.clone());
        }
        affected.extend(
            self.protocol
                .ancestors(role)
                .into_iter()
                .filter(|ancestor| self.device_deployments.contains_key(ancestor)),
        );

        let now = Utc::now();
        for primary in affected {
            let Some(record) = self.device_deployments.get_mut(&primary) else {
                continue;
            };
            record.last_issued = None;
            record.last_issued_on = None;
            if record.deployed.is_some() && !record.needs_redeployment {
                record.needs_redeployment = true;
                self.pending_events.push(DeploymentEvent::RedeploymentRequired {
                    deployment_id: self.id,
                    role_name: primary.clone(),
                    required_at: now,
                });
                info!(deployment_id = %self.id, role = %primary, "Device configuration is stale, redeployment required");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Deployment state machine
    // ------------------------------------------------------------------------

    /// True iff `role` is a primary device and every device in its subtree,
    /// itself included, holds a registration.
    pub fn can_obtain_device_deployment(&self, role: &RoleName) -> Result<bool, DeploymentError> {
        self.known_primary(role)?;
        Ok(self.unregistered_in_subtree(role).is_empty())
    }

    /// Assemble and fingerprint the configuration for primary device `role`.
    ///
    /// Issuing again without changes to the subtree returns the same
    /// fingerprint and records nothing new.
    pub fn issue_device_deployment(&mut self, role: &RoleName) -> Result<IssuedDeviceDeployment, DeploymentError> {
        self.ensure_running()?;
        self.known_primary(role)?;
        let remaining = self.unregistered_in_subtree(role);
        if !remaining.is_empty() {
            return Err(DeploymentError::NotReady {
                device: role.clone(),
                remaining,
            });
        }

        let snapshot = self.build_device_deployment(role)?;
        let fingerprint = compute_fingerprint(&snapshot)?;

        let record = self.device_deployments.entry(role.clone()).or_default();
        if record.last_issued.as_ref() != Some(&fingerprint) {
            let now = Utc::now();
            record.last_issued = Some(fingerprint.clone());
            record.last_issued_on = Some(now);
            self.pending_events.push(DeploymentEvent::DeviceDeploymentIssued {
                deployment_id: self.id,
                role_name: role.clone(),
                fingerprint: fingerprint.clone(),
                issued_at: now,
            });
            info!(deployment_id = %self.id, role = %role, fingerprint = %fingerprint, "Device configuration issued");
        }

        Ok(IssuedDeviceDeployment {
            deployment: snapshot,
            fingerprint,
        })
    }

    /// Mark the configuration identified by `fingerprint` as applied by `role`.
    pub fn confirm_device_deployment(
        &mut self,
        role: &RoleName,
        fingerprint: &Fingerprint,
    ) -> Result<StudyDeploymentStatus, DeploymentError> {
        self.ensure_running()?;
        self.known_primary(role)?;

        let record = self.device_deployments.get(role).cloned().unwrap_or_default();
        if record.last_issued.as_ref() != Some(fingerprint) {
            return Err(DeploymentError::InconsistentDeployment {
                device: role.clone(),
                expected: record.last_issued,
                received: fingerprint.clone(),
            });
        }
        if record.deployed.as_ref() == Some(fingerprint) && !record.needs_redeployment {
            return Ok(self.get_status());
        }

        let was_ready = self.is_ready();
        let now = Utc::now();
        let record = self.device_deployments.entry(role.clone()).or_default();
        record.deployed = Some(fingerprint.clone());
        record.deployed_on = Some(now);
        record.needs_redeployment = false;
        self.record(DeploymentEvent::DeviceDeployed {
            deployment_id: self.id,
            role_name: role.clone(),
            fingerprint: fingerprint.clone(),
            deployed_at: now,
        });
        self.track_readiness(was_ready);

        info!(deployment_id = %self.id, role = %role, "Device deployment confirmed");
        Ok(self.get_status())
    }

    /// Stop the deployment. Stopping twice is a no-op.
    pub fn stop(&mut self) -> StudyDeploymentStatus {
        if !self.is_stopped() {
            let now = Utc::now();
            self.lifecycle = Lifecycle::Stopped;
            self.stopped_on = Some(now);
            self.record(DeploymentEvent::DeploymentStopped {
                deployment_id: self.id,
                stopped_at: now,
            });
            info!(deployment_id = %self.id, "Study deployment stopped");
        }
        self.get_status()
    }

    pub fn get_status(&self) -> StudyDeploymentStatus {
        let devices = self
            .protocol
            .devices()
            .map(|device| self.device_status(device))
            .collect();

        let state = if self.is_stopped() {
            DeploymentState::Stopped
        } else if self.registration_history.is_empty() {
            DeploymentState::Invited
        } else if self.is_ready() {
            DeploymentState::DeploymentReady
        } else {
            DeploymentState::DeployingDevices
        };

        StudyDeploymentStatus {
            deployment_id: self.id,
            protocol_name: self.protocol.name.clone(),
            state,
            devices,
            created_on: self.created_on,
            ready_on: self.ready_on,
            stopped_on: self.stopped_on,
        }
    }

    fn device_status(&self, device: &DeviceDescriptor) -> DeviceDeploymentStatus {
        let role = &device.role_name;
        let registered = self.registered_devices.contains_key(role);
        let remaining = if device.is_primary {
            self.unregistered_in_subtree(role)
        } else if registered {
            Vec::new()
        } else {
            vec![role.clone()]
        };
        let state = self.device_state(device);
        let deployed_fingerprint = match state {
            DeviceDeploymentState::Deployed | DeviceDeploymentState::NeedsRedeployment => self
                .device_deployments
                .get(role)
                .and_then(|r| r.deployed.clone()),
            _ => None,
        };

        DeviceDeploymentStatus {
            role_name: role.clone(),
            is_primary: device.is_primary,
            is_optional: device.is_optional,
            state,
            can_obtain_deployment: device.is_primary && remaining.is_empty(),
            remaining_devices_to_register: remaining,
            deployed_fingerprint,
        }
    }

    fn device_state(&self, device: &DeviceDescriptor) -> DeviceDeploymentState {
        if !self.registered_devices.contains_key(&device.role_name) {
            return DeviceDeploymentState::Unregistered;
        }
        if !device.is_primary {
            return DeviceDeploymentState::Registered;
        }

        match self.device_deployments.get(&device.role_name) {
            Some(record) if record.deployed.is_some() && record.needs_redeployment => {
                DeviceDeploymentState::NeedsRedeployment
            }
            Some(record) if record.deployed.is_some() => DeviceDeploymentState::Deployed,
            _ => DeviceDeploymentState::Registered,
        }
    }

    /// Every required primary device is deployed, at least one primary device
    /// is deployed, and no primary device awaits redeployment.
    fn is_ready(&self) -> bool {
        let states: Vec<(bool, DeviceDeploymentState)> = self
            .protocol
            .primary_devices()
            .map(|d| (d.is_optional, self.device_state(d)))
            .collect();

        let any_deployed = states
            .iter()
            .any(|(_, state)| *state == DeviceDeploymentState::Deployed);

        any_deployed
            && states.iter().all(|(optional, state)| {
                *state != DeviceDeploymentState::NeedsRedeployment
                    && (*optional || *state == DeviceDeploymentState::Deployed)
            })
    }

    fn track_readiness(&mut self, was_ready: bool) {
        if was_ready || !self.is_ready() {
            return;
        }

        let now = Utc::now();
        if self.ready_on.is_none() {
            self.ready_on = Some(now);
        }
        self.record(DeploymentEvent::DeploymentReady {
            deployment_id: self.id,
            ready_at: now,
        });
        info!(deployment_id = %self.id, "Study deployment ready");
    }

    fn build_device_deployment(&self, role: &RoleName) -> Result<PrimaryDeviceDeployment, DeploymentError> {
        let device = self.known_primary(role)?.clone();
        let registration = self
            .registered_devices
            .get(role)
            .cloned()
            .ok_or_else(|| DeploymentError::NotReady {
                device: role.clone(),
                remaining: vec![role.clone()],
            })?;
        let subtree = self
            .protocol
            .subtree(role)
            .map_err(|_| DeploymentError::UnknownRole(role.clone()))?;
        let dependents: Vec<&RoleName> = subtree.iter().filter(|r| *r != role).collect();

        let connected_devices = dependents
            .iter()
            .filter_map(|r| self.protocol.device(r).cloned())
            .collect();
        let connections = dependents
            .iter()
            .filter_map(|r| {
                self.protocol
                    .parent_of(r)
                    .map(|parent| ((*r).clone(), parent.clone()))
            })
            .collect();
        let connected_device_registrations = dependents
            .iter()
            .filter_map(|r| {
                self.registered_devices
                    .get(*r)
                    .map(|registration| ((*r).clone(), registration.clone()))
            })
            .collect();

        let mut task_controls: Vec<TaskControl> = self
            .protocol
            .task_controls()
            .iter()
            .filter(|c| subtree.contains(&c.destination_device_role))
            .cloned()
            .collect();
        task_controls.sort();

        let task_names: BTreeSet<&str> = task_controls.iter().map(|c| c.task_name.as_str()).collect();
        let tasks = task_names
            .into_iter()
            .filter_map(|name| self.protocol.task(name).cloned())
            .collect();

        let trigger_ids: BTreeSet<TriggerId> = task_controls.iter().map(|c| c.trigger_id).collect();
        let triggers = trigger_ids
            .into_iter()
            .filter_map(|id| self.protocol.triggers().get(&id).map(|t| (id, t.clone())))
            .collect();

        Ok(PrimaryDeviceDeployment {
            deployment_id: self.id,
            device,
            registration,
            connected_devices,
            connections,
            connected_device_registrations,
            tasks,
            triggers,
            task_controls,
        })
    }

    // ------------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), DeploymentError> {
        if self.is_stopped() {
            return Err(DeploymentError::DeploymentStopped(self.id));
        }
        Ok(())
    }

    fn known_device(&self, role: &RoleName) -> Result<&DeviceDescriptor, DeploymentError> {
        self.protocol
            .device(role)
            .ok_or_else(|| DeploymentError::UnknownRole(role.clone()))
    }

    fn known_primary(&self, role: &RoleName) -> Result<&DeviceDescriptor, DeploymentError> {
        let device = self.known_device(role)?;
        if !device.is_primary {
            return Err(DeploymentError::NotPrimaryDevice(role.clone()));
        }
        Ok(device)
    }

    fn unregistered_in_subtree(&self, role: &RoleName) -> Vec<RoleName> {
        self.protocol
            .subtree(role)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !self.registered_devices.contains_key(r))
            .collect()
    }

    fn record(&mut self, event: DeploymentEvent) {
        self.pending_events.push(event);
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

/// Caller-facing classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Caller error; retrying the same request will not help.
    Validation,
    /// Conflicts with current state; retry against freshly loaded state.
    Conflict,
    /// Not possible in the current state; wait, poll or give up.
    State,
    /// Confirmation does not match the issued configuration; re-fetch it.
    InconsistentDeployment,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeploymentError {
    #[error("Protocol cannot be deployed: {0:?}")]
    ProtocolNotDeployable(Vec<DeploymentIssue>),

    #[error("Role '{0}' is not part of the deployed protocol")]
    UnknownRole(RoleName),

    #[error("Device '{0}' is not a primary device")]
    NotPrimaryDevice(RoleName),

    #[error("Invalid registration for '{device}': {reason}")]
    InvalidRegistration { device: RoleName, reason: String },

    #[error("Device id '{device_id}' is already registered to '{registered_to}'")]
    DuplicateDeviceId {
        device_id: String,
        registered_to: RoleName,
    },

    #[error("Device '{0}' is already registered")]
    AlreadyRegistered(RoleName),

    #[error("Device '{0}' is not registered")]
    NotRegistered(RoleName),

    #[error("Configuration for '{device}' is not ready, waiting for registration of {remaining:?}")]
    NotReady {
        device: RoleName,
        remaining: Vec<RoleName>,
    },

    #[error("Study deployment {0} is stopped")]
    DeploymentStopped(DeploymentId),

    #[error("Fingerprint {received} does not match the configuration issued to '{device}'")]
    InconsistentDeployment {
        device: RoleName,
        expected: Option<Fingerprint>,
        received: Fingerprint,
    },

    #[error("Failed to render configuration snapshot: {0}")]
    Snapshot(String),
}

impl DeploymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolNotDeployable(_)
            | Self::UnknownRole(_)
            | Self::NotPrimaryDevice(_)
            | Self::InvalidRegistration { .. }
            | Self::Snapshot(_) => ErrorKind::Validation,
            Self::DuplicateDeviceId { .. } | Self::AlreadyRegistered(_) | Self::NotRegistered(_) => {
                ErrorKind::Conflict
            }
            Self::NotReady { .. } | Self::DeploymentStopped(_) => ErrorKind::State,
            Self::InconsistentDeployment { .. } => ErrorKind::InconsistentDeployment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::consistency::BuiltinDeviceCapabilities;
    use crate::domain::device::{DeviceKind, RegistrationDetails};
    use crate::domain::protocol::{Control, TriggerKind};
    use std::time::Duration;

    fn role(name: &str) -> RoleName {
        RoleName::new(name).unwrap()
    }

    fn sensor_registration(device_id: &str) -> DeviceRegistration {
        DeviceRegistration::new(device_id).with_details(RegistrationDetails::MacAddress {
            mac_address: "00:11:22:33:44:55".to_string(),
        })
    }

    /// Phone (primary) -> Sensor (heart rate strap)
    fn phone_sensor_protocol() -> StudyProtocol {
        let mut protocol = StudyProtocol::new("phone-sensor");
        protocol
            .add_primary_device(DeviceDescriptor::primary(role("Phone"), DeviceKind::Smartphone))
            .unwrap();
        protocol
            .add_connected_device(
                DeviceDescriptor::connected(role("Sensor"), DeviceKind::BleHeartRateDevice),
                &role("Phone"),
            )
            .unwrap();
        protocol.add_task(TaskDescriptor::new("Monitor").with_measures(["heartrate"])).unwrap();
        let trigger = protocol.add_trigger(Trigger {
            source_device_role: role("Phone"),
            kind: TriggerKind::ElapsedTime { elapsed: Duration::ZERO },
        }).unwrap();
        protocol.add_task_control(TaskControl {
            trigger_id: trigger,
            task_name: "Monitor".to_string(),
            destination_device_role: role("Sensor"),
            control: Control::Start,
        });
        protocol
    }

    fn deployment() -> StudyDeployment {
        StudyDeployment::new(phone_sensor_protocol()).unwrap()
    }

    fn deploy_phone(deployment: &mut StudyDeployment) -> Fingerprint {
        let issued = deployment.issue_device_deployment(&role("Phone")).unwrap();
        deployment
            .confirm_device_deployment(&role("Phone"), &issued.fingerprint)
            .unwrap();
        issued.fingerprint
    }

    #[test]
    fn test_undeployable_protocol_is_rejected() {
        let result = StudyDeployment::new(StudyProtocol::new("empty"));
        assert!(matches!(
            result,
            Err(DeploymentError::ProtocolNotDeployable(ref issues)) if issues.contains(&DeploymentIssue::NoPrimaryDevice)
        ));
    }

    #[test]
    fn test_new_deployment_is_invited() {
        let mut deployment = deployment();
        let status = deployment.get_status();
        assert_eq!(status.state, DeploymentState::Invited);
        assert_eq!(status.device("Phone").unwrap().state, DeviceDeploymentState::Unregistered);
        assert_eq!(
            status.device("Phone").unwrap().remaining_devices_to_register,
            vec![role("Phone"), role("Sensor")]
        );
        assert!(matches!(
            deployment.take_events().as_slice(),
            [DeploymentEvent::DeploymentCreated { .. }]
        ));
    }

    #[test]
    fn test_unregistering_every_device_does_not_return_to_invited() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("phone"))
            .unwrap();
        let status = deployment.unregister_device(&role("Phone")).unwrap();

        assert!(deployment.registered_devices().is_empty());
        assert_eq!(status.state, DeploymentState::DeployingDevices);
        assert_eq!(status.device("Phone").unwrap().state, DeviceDeploymentState::Unregistered);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let mut deployment = deployment();
        let result = deployment.register_device(
            &BuiltinDeviceCapabilities,
            &role("Tablet"),
            DeviceRegistration::new("t"),
        );
        assert_eq!(result, Err(DeploymentError::UnknownRole(role("Tablet"))));
    }

    #[test]
    fn test_invalid_registration_is_rejected() {
        let mut deployment = deployment();
        let result = deployment.register_device(
            &BuiltinDeviceCapabilities,
            &role("Sensor"),
            DeviceRegistration::new("strap"),
        );
        assert!(matches!(result, Err(DeploymentError::InvalidRegistration { .. })));
        assert!(deployment.registration(&role("Sensor")).is_none());
    }

    #[test]
    fn test_register_twice_requires_unregister() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p1"))
            .unwrap();
        let result = deployment.register_device(
            &BuiltinDeviceCapabilities,
            &role("Phone"),
            DeviceRegistration::new("p2"),
        );
        assert_eq!(result, Err(DeploymentError::AlreadyRegistered(role("Phone"))));

        deployment.unregister_device(&role("Phone")).unwrap();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p2"))
            .unwrap();
        assert_eq!(deployment.registration(&role("Phone")).unwrap().device_id, "p2");
        assert_eq!(deployment.registration_history(&role("Phone")).len(), 2);
    }

    #[test]
    fn test_duplicate_device_id_across_roles() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("same"))
            .unwrap();
        let result = deployment.register_device(
            &BuiltinDeviceCapabilities,
            &role("Sensor"),
            sensor_registration("same"),
        );
        assert_eq!(
            result,
            Err(DeploymentError::DuplicateDeviceId {
                device_id: "same".to_string(),
                registered_to: role("Phone"),
            })
        );
    }

    #[test]
    fn test_issue_requires_full_subtree() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        assert!(!deployment.can_obtain_device_deployment(&role("Phone")).unwrap());
        assert_eq!(
            deployment.issue_device_deployment(&role("Phone")),
            Err(DeploymentError::NotReady {
                device: role("Phone"),
                remaining: vec![role("Sensor")],
            })
        );

        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s"))
            .unwrap();
        assert!(deployment.can_obtain_device_deployment(&role("Phone")).unwrap());
        assert_eq!(
            deployment.can_obtain_device_deployment(&role("Sensor")),
            Err(DeploymentError::NotPrimaryDevice(role("Sensor")))
        );
    }

    #[test]
    fn test_issued_snapshot_contents() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s"))
            .unwrap();

        let issued = deployment.issue_device_deployment(&role("Phone")).unwrap();
        let snapshot = &issued.deployment;
        assert_eq!(snapshot.role_name(), &role("Phone"));
        assert_eq!(snapshot.registration.device_id, "p");
        assert_eq!(snapshot.connected_devices.len(), 1);
        assert_eq!(snapshot.connections.get(&role("Sensor")), Some(&role("Phone")));
        assert_eq!(snapshot.connected_device_registrations[&role("Sensor")].device_id, "s");
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.triggers.len(), 1);
        assert_eq!(snapshot.task_controls.len(), 1);
    }

    #[test]
    fn test_reissue_is_idempotent() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s"))
            .unwrap();
        deployment.take_events();

        let first = deployment.issue_device_deployment(&role("Phone")).unwrap();
        assert_eq!(deployment.take_events().len(), 1);
        let second = deployment.issue_device_deployment(&role("Phone")).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(deployment.take_events().is_empty());
    }

    #[test]
    fn test_confirm_with_wrong_fingerprint_leaves_state_unchanged() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s"))
            .unwrap();
        deployment.issue_device_deployment(&role("Phone")).unwrap();

        let before = deployment.clone();
        let result = deployment.confirm_device_deployment(&role("Phone"), &Fingerprint::new("bogus"));
        assert!(matches!(result, Err(DeploymentError::InconsistentDeployment { .. })));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InconsistentDeployment);
        assert_eq!(deployment, before);
    }

    #[test]
    fn test_replacing_connected_registration_requires_redeployment() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s1"))
            .unwrap();
        let old = deploy_phone(&mut deployment);
        assert_eq!(deployment.get_status().state, DeploymentState::DeploymentReady);

        let status = deployment
            .replace_registration(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s2"))
            .unwrap();
        assert_eq!(status.device("Phone").unwrap().state, DeviceDeploymentState::NeedsRedeployment);
        assert_eq!(status.state, DeploymentState::DeployingDevices);
        assert!(matches!(
            deployment.confirm_device_deployment(&role("Phone"), &old),
            Err(DeploymentError::InconsistentDeployment { .. })
        ));

        let new = deploy_phone(&mut deployment);
        assert_ne!(old, new);
        assert_eq!(deployment.get_status().state, DeploymentState::DeploymentReady);
    }

    #[test]
    fn test_replace_with_identical_registration_is_noop() {
        let mut deployment = deployment();
        let registration = DeviceRegistration::new("p");
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), registration.clone())
            .unwrap();
        deployment.take_events();
        deployment
            .replace_registration(&BuiltinDeviceCapabilities, &role("Phone"), registration)
            .unwrap();
        assert!(deployment.take_events().is_empty());
        assert_eq!(
            deployment.replace_registration(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s")),
            Err(DeploymentError::NotRegistered(role("Sensor")))
        );
    }

    #[test]
    fn test_unregistering_primary_resets_its_deployment() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Sensor"), sensor_registration("s"))
            .unwrap();
        deploy_phone(&mut deployment);

        let status = deployment.unregister_device(&role("Phone")).unwrap();
        assert_eq!(status.device("Phone").unwrap().state, DeviceDeploymentState::Unregistered);
        assert_eq!(status.state, DeploymentState::DeployingDevices);
        assert!(deployment.ready_on().is_some());

        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        assert_eq!(
            deployment.get_status().device("Phone").unwrap().state,
            DeviceDeploymentState::Registered
        );
    }

    #[test]
    fn test_stopped_deployment_rejects_mutations() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        let status = deployment.stop();
        assert_eq!(status.state, DeploymentState::Stopped);
        let stopped_on = deployment.stopped_on();

        let id = deployment.id;
        assert_eq!(
            deployment.unregister_device(&role("Phone")),
            Err(DeploymentError::DeploymentStopped(id))
        );
        assert_eq!(
            deployment.issue_device_deployment(&role("Phone")),
            Err(DeploymentError::DeploymentStopped(id))
        );
        assert_eq!(deployment.stop().state, DeploymentState::Stopped);
        assert_eq!(deployment.stopped_on(), stopped_on);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(DeploymentError::UnknownRole(role("x")).kind(), ErrorKind::Validation);
        assert_eq!(DeploymentError::AlreadyRegistered(role("x")).kind(), ErrorKind::Conflict);
        assert_eq!(
            DeploymentError::DeploymentStopped(DeploymentId::new()).kind(),
            ErrorKind::State
        );
    }

    #[test]
    fn test_deployment_survives_serialization() {
        let mut deployment = deployment();
        deployment
            .register_device(&BuiltinDeviceCapabilities, &role("Phone"), DeviceRegistration::new("p"))
            .unwrap();
        deployment.take_events();

        let json = serde_json::to_string(&deployment).unwrap();
        let restored: StudyDeployment = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, deployment);
        assert_eq!(restored.get_status(), deployment.get_status());
    }
}
