// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::consistency::Fingerprint;
use crate::domain::deployment::DeploymentId;
use crate::domain::device::RoleName;

/// Status changes of a study deployment, published after the change is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    DeploymentCreated {
        deployment_id: DeploymentId,
        protocol_name: String,
        created_at: DateTime<Utc>,
    },
    DeviceRegistered {
        deployment_id: DeploymentId,
        role_name: RoleName,
        device_id: String,
        /// True when an existing registration was swapped out.
        replaced: bool,
        registered_at: DateTime<Utc>,
    },
    DeviceUnregistered {
        deployment_id: DeploymentId,
        role_name: RoleName,
        unregistered_at: DateTime<Utc>,
    },
    DeviceDeploymentIssued {
        deployment_id: DeploymentId,
        role_name: RoleName,
        fingerprint: Fingerprint,
        issued_at: DateTime<Utc>,
    },
    DeviceDeployed {
        deployment_id: DeploymentId,
        role_name: RoleName,
        fingerprint: Fingerprint,
        deployed_at: DateTime<Utc>,
    },
    RedeploymentRequired {
        deployment_id: DeploymentId,
        role_name: RoleName,
        required_at: DateTime<Utc>,
    },
    DeploymentReady {
        deployment_id: DeploymentId,
        ready_at: DateTime<Utc>,
    },
    DeploymentStopped {
        deployment_id: DeploymentId,
        stopped_at: DateTime<Utc>,
    },
}

impl DeploymentEvent {
    pub fn deployment_id(&self) -> DeploymentId {
        match self {
            Self::DeploymentCreated { deployment_id, .. }
            | Self::DeviceRegistered { deployment_id, .. }
            | Self::DeviceUnregistered { deployment_id, .. }
            | Self::DeviceDeploymentIssued { deployment_id, .. }
            | Self::DeviceDeployed { deployment_id, .. }
            | Self::RedeploymentRequired { deployment_id, .. }
            | Self::DeploymentReady { deployment_id, .. }
            | Self::DeploymentStopped { deployment_id, .. } => *deployment_id,
        }
    }

    /// Role the event concerns, if it is about a single device.
    pub fn role_name(&self) -> Option<&RoleName> {
        match self {
            Self::DeviceRegistered { role_name, .. }
            | Self::DeviceUnregistered { role_name, .. }
            | Self::DeviceDeploymentIssued { role_name, .. }
            | Self::DeviceDeployed { role_name, .. }
            | Self::RedeploymentRequired { role_name, .. } => Some(role_name),
            Self::DeploymentCreated { .. }
            | Self::DeploymentReady { .. }
            | Self::DeploymentStopped { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DeploymentCreated { .. } => "deployment_created",
            Self::DeviceRegistered { .. } => "device_registered",
            Self::DeviceUnregistered { .. } => "device_unregistered",
            Self::DeviceDeploymentIssued { .. } => "device_deployment_issued",
            Self::DeviceDeployed { .. } => "device_deployed",
            Self::RedeploymentRequired { .. } => "redeployment_required",
            Self::DeploymentReady { .. } => "deployment_ready",
            Self::DeploymentStopped { .. } => "deployment_stopped",
        }
    }
}
