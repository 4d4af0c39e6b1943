// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deployment Service
//!
//! Application service coordinating study deployments across devices.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Run commands against the StudyDeployment aggregate
//!   under optimistic concurrency and publish the resulting events
//! - **Collaborators:**
//!   - Domain: StudyDeployment aggregate, DeviceCapabilityProvider
//!   - Infrastructure: StudyDeploymentRepository, EventBus
//!
//! # Flow (every mutation)
//!
//! 1. Load the deployment and its version
//! 2. Apply the command to the aggregate (all validation happens here)
//! 3. If the aggregate recorded no events, return without writing
//! 4. Save against the loaded version
//! 5. On a version conflict, start over from step 1 (bounded)
//! 6. Publish the recorded events
//!
//! Retrying re-applies the command to freshly loaded state; concurrent writes
//! are never merged.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::consistency::{DeviceCapabilityProvider, Fingerprint};
use crate::domain::deployment::{
    DeploymentError, DeploymentId, ErrorKind, IssuedDeviceDeployment, StudyDeployment,
    StudyDeploymentStatus,
};
use crate::domain::device::{DeviceRegistration, RoleName};
use crate::domain::protocol::{DeploymentIssue, StudyProtocol};
use crate::domain::repository::{
    ExpectedVersion, RepositoryError, StudyDeploymentRepository, Versioned,
};
use crate::infrastructure::event_bus::EventBus;

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Deployment Service Use Cases
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Instantiate a deployment for a deployable protocol.
    async fn create_deployment(&self, protocol: StudyProtocol) -> Result<DeploymentId, DeploymentServiceError>;

    async fn register_device(
        &self,
        id: DeploymentId,
        role: &RoleName,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError>;

    /// Swap the registration currently held by `role`.
    async fn replace_device_registration(
        &self,
        id: DeploymentId,
        role: &RoleName,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError>;

    async fn unregister_device(
        &self,
        id: DeploymentId,
        role: &RoleName,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError>;

    async fn get_deployment_status(&self, id: DeploymentId) -> Result<StudyDeploymentStatus, DeploymentServiceError>;

    /// Configuration for a primary device. Only writes when the configuration
    /// differs from the one issued last.
    async fn get_device_deployment(
        &self,
        id: DeploymentId,
        role: &RoleName,
    ) -> Result<IssuedDeviceDeployment, DeploymentServiceError>;

    async fn confirm_device_deployment(
        &self,
        id: DeploymentId,
        role: &RoleName,
        fingerprint: &Fingerprint,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError>;

    async fn stop(&self, id: DeploymentId) -> Result<StudyDeploymentStatus, DeploymentServiceError>;

    async fn list_deployments(&self) -> Result<Vec<StudyDeploymentStatus>, DeploymentServiceError>;
}

/// Standard implementation of DeploymentService
pub struct StandardDeploymentService {
    repository: Arc<dyn StudyDeploymentRepository>,
    capabilities: Arc<dyn DeviceCapabilityProvider>,
    event_bus: Arc<EventBus>,
    max_conflict_retries: u32,
}

impl StandardDeploymentService {
    pub fn new(
        repository: Arc<dyn StudyDeploymentRepository>,
        capabilities: Arc<dyn DeviceCapabilityProvider>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            repository,
            capabilities,
            event_bus,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    async fn load(&self, id: DeploymentId) -> Result<Versioned<StudyDeployment>, DeploymentServiceError> {
        self.repository
            .load(id)
            .await?
            .ok_or(DeploymentServiceError::NotFound(id))
    }

    /// Run `command` against the latest stored deployment, retrying on
    /// version conflicts.
    async fn mutate<T, F>(&self, id: DeploymentId, mut command: F) -> Result<T, DeploymentServiceError>
    where
        T: Send,
        F: FnMut(&mut StudyDeployment) -> Result<T, DeploymentError> + Send,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let Versioned {
                value: mut deployment,
                version,
            } = self.load(id).await?;

            let output = command(&mut deployment)?;
            let events = deployment.take_events();
            if events.is_empty() {
                return Ok(output);
            }

            match self
                .repository
                .save(&deployment, ExpectedVersion::Exactly(version))
                .await
            {
                Ok(_) => {
                    self.event_bus.publish_all(events);
                    return Ok(output);
                }
                Err(RepositoryError::VersionConflict { .. }) => {
                    counter!("fieldstudy_version_conflicts_total").increment(1);
                    if attempts > self.max_conflict_retries {
                        warn!(deployment_id = %id, attempts, "Giving up after repeated version conflicts");
                        return Err(DeploymentServiceError::Conflict {
                            deployment_id: id,
                            attempts,
                        });
                    }
                    warn!(deployment_id = %id, attempt = attempts, "Version conflict, retrying against fresh state");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl DeploymentService for StandardDeploymentService {
    async fn create_deployment(&self, protocol: StudyProtocol) -> Result<DeploymentId, DeploymentServiceError> {
        let mut deployment = StudyDeployment::new(protocol).map_err(|e| match e {
            DeploymentError::ProtocolNotDeployable(issues) => DeploymentServiceError::InvalidProtocol(issues),
            other => DeploymentServiceError::Domain(other),
        })?;

        self.repository.save(&deployment, ExpectedVersion::New).await?;
        self.event_bus.publish_all(deployment.take_events());

        info!(deployment_id = %deployment.id, "Deployment created");
        Ok(deployment.id)
    }

    async fn register_device(
        &self,
        id: DeploymentId,
        role: &RoleName,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError> {
        let capabilities = self.capabilities.clone();
        let status = self
            .mutate(id, |deployment| {
                deployment.register_device(capabilities.as_ref(), role, registration.clone())
            })
            .await?;

        counter!("fieldstudy_devices_registered_total").increment(1);
        Ok(status)
    }

    async fn replace_device_registration(
        &self,
        id: DeploymentId,
        role: &RoleName,
        registration: DeviceRegistration,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError> {
        let capabilities = self.capabilities.clone();
        let status = self
            .mutate(id, |deployment| {
                deployment.replace_registration(capabilities.as_ref(), role, registration.clone())
            })
            .await?;

        counter!("fieldstudy_devices_registered_total").increment(1);
        Ok(status)
    }

    async fn unregister_device(
        &self,
        id: DeploymentId,
        role: &RoleName,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError> {
        self.mutate(id, |deployment| deployment.unregister_device(role)).await
    }

    async fn get_deployment_status(&self, id: DeploymentId) -> Result<StudyDeploymentStatus, DeploymentServiceError> {
        Ok(self.load(id).await?.value.get_status())
    }

    async fn get_device_deployment(
        &self,
        id: DeploymentId,
        role: &RoleName,
    ) -> Result<IssuedDeviceDeployment, DeploymentServiceError> {
        self.mutate(id, |deployment| deployment.issue_device_deployment(role)).await
    }

    async fn confirm_device_deployment(
        &self,
        id: DeploymentId,
        role: &RoleName,
        fingerprint: &Fingerprint,
    ) -> Result<StudyDeploymentStatus, DeploymentServiceError> {
        let status = self
            .mutate(id, |deployment| deployment.confirm_device_deployment(role, fingerprint))
            .await?;

        counter!("fieldstudy_device_deployments_confirmed_total").increment(1);
        Ok(status)
    }

    async fn stop(&self, id: DeploymentId) -> Result<StudyDeploymentStatus, DeploymentServiceError> {
        self.mutate(id, |deployment| Ok(deployment.stop())).await
    }

    async fn list_deployments(&self) -> Result<Vec<StudyDeploymentStatus>, DeploymentServiceError> {
        let mut statuses = Vec::new();
        for id in self.repository.list_ids().await? {
            if let Some(stored) = self.repository.load(id).await? {
                statuses.push(stored.value.get_status());
            }
        }
        statuses.sort_by_key(|s| s.created_on);
        Ok(statuses)
    }
}

/// Errors surfaced by the deployment service
#[derive(Debug, thiserror::Error)]
pub enum DeploymentServiceError {
    #[error("Deployment not found: {0}")]
    NotFound(DeploymentId),

    #[error("Protocol cannot be deployed: {}", format_issues(.0))]
    InvalidProtocol(Vec<DeploymentIssue>),

    #[error(transparent)]
    Domain(#[from] DeploymentError),

    #[error("Deployment {deployment_id} kept changing concurrently, gave up after {attempts} attempts")]
    Conflict {
        deployment_id: DeploymentId,
        attempts: u32,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl DeploymentServiceError {
    /// Classification for callers; `None` for storage failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NotFound(_) => Some(ErrorKind::NotFound),
            Self::InvalidProtocol(_) => Some(ErrorKind::Validation),
            Self::Domain(e) => Some(e.kind()),
            Self::Conflict { .. } => Some(ErrorKind::Conflict),
            Self::Repository(_) => None,
        }
    }
}

fn format_issues(issues: &[DeploymentIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
