// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contract for the [`StudyDeployment`] aggregate, following the
//! DDD Repository pattern: interface defined in the domain layer, implemented
//! in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `StudyDeploymentRepository` | `StudyDeployment` | `InMemoryStudyDeploymentRepository`, `FileStudyDeploymentRepository` |
//!
//! ## Optimistic Concurrency
//!
//! Every stored deployment carries a version that increases by one per
//! successful save. Writers state the version they loaded through
//! [`ExpectedVersion`]; a save against a stale version fails with
//! [`RepositoryError::VersionConflict`] and nothing is written. Callers
//! reload, re-apply their change and try again.

use async_trait::async_trait;

use crate::domain::deployment::{DeploymentId, StudyDeployment};

/// Version a writer expects the stored aggregate to be at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The aggregate must not exist yet.
    New,
    /// The stored aggregate must be at exactly this version.
    Exactly(u64),
}

/// An aggregate together with the version it was loaded at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Repository interface for StudyDeployment aggregates
#[async_trait]
pub trait StudyDeploymentRepository: Send + Sync {
    /// Load a deployment and its current version.
    async fn load(&self, id: DeploymentId) -> Result<Option<Versioned<StudyDeployment>>, RepositoryError>;

    /// Store a deployment if the stored version matches `expected`.
    /// Returns the new version.
    async fn save(
        &self,
        deployment: &StudyDeployment,
        expected: ExpectedVersion,
    ) -> Result<u64, RepositoryError>;

    /// Ids of all stored deployments.
    async fn list_ids(&self) -> Result<Vec<DeploymentId>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Deployment not found: {0}")]
    NotFound(DeploymentId),

    #[error("Version conflict on deployment {id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        id: DeploymentId,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("Deployment already exists: {0}")]
    AlreadyExists(DeploymentId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ExpectedVersion {
    /// Whether a stored version (None when absent) satisfies this expectation.
    pub fn matches(&self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (Self::New, None) => true,
            (Self::Exactly(expected), Some(actual)) => *expected == actual,
            _ => false,
        }
    }

    /// Version assigned by a successful save.
    pub fn next(&self) -> u64 {
        match self {
            Self::New => 1,
            Self::Exactly(version) => version + 1,
        }
    }
}
