// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstraction defined in
//! the domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve study deployments
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryStudyDeploymentRepository** - Thread-safe HashMap-backed storage
//! - **FileStudyDeploymentRepository** - One snapshot file per deployment,
//!   encoded by an injected [`SnapshotCodec`](crate::infrastructure::codec::SnapshotCodec)
//!
//! Both enforce [`ExpectedVersion`] atomically: the version check and the
//! write happen under one lock.

pub mod file;

pub use file::FileStudyDeploymentRepository;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::deployment::{DeploymentId, StudyDeployment};
use crate::domain::repository::{
    ExpectedVersion, RepositoryError, StudyDeploymentRepository, Versioned,
};

#[derive(Clone, Default)]
pub struct InMemoryStudyDeploymentRepository {
    deployments: Arc<RwLock<HashMap<DeploymentId, (u64, StudyDeployment)>>>,
}

impl InMemoryStudyDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StudyDeploymentRepository for InMemoryStudyDeploymentRepository {
    async fn load(&self, id: DeploymentId) -> Result<Option<Versioned<StudyDeployment>>, RepositoryError> {
        let deployments = self.deployments.read();
        Ok(deployments.get(&id).map(|(version, deployment)| Versioned {
            value: deployment.clone(),
            version: *version,
        }))
    }

    async fn save(
        &self,
        deployment: &StudyDeployment,
        expected: ExpectedVersion,
    ) -> Result<u64, RepositoryError> {
        let mut deployments = self.deployments.write();
        let actual = deployments.get(&deployment.id).map(|(version, _)| *version);
        if !expected.matches(actual) {
            return Err(match (expected, actual) {
                (ExpectedVersion::New, Some(_)) => RepositoryError::AlreadyExists(deployment.id),
                _ => RepositoryError::VersionConflict {
                    id: deployment.id,
                    expected,
                    actual,
                },
            });
        }

        let mut stored = deployment.clone();
        stored.take_events();
        let version = expected.next();
        deployments.insert(deployment.id, (version, stored));
        Ok(version)
    }

    async fn list_ids(&self) -> Result<Vec<DeploymentId>, RepositoryError> {
        let deployments = self.deployments.read();
        let mut ids: Vec<DeploymentId> = deployments.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
