// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File-backed deployment repository.
//!
//! Each deployment lives in `<dir>/<deployment-id>.<ext>`. Writes go to a
//! temporary sibling which is then renamed over the target, so readers never
//! see a half-written snapshot. Saves are serialized within the process;
//! several processes sharing a directory are not coordinated.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::deployment::{DeploymentId, StudyDeployment};
use crate::domain::repository::{
    ExpectedVersion, RepositoryError, StudyDeploymentRepository, Versioned,
};
use crate::infrastructure::codec::{DeploymentSnapshot, SnapshotCodec};

pub struct FileStudyDeploymentRepository {
    dir: PathBuf,
    codec: Arc<dyn SnapshotCodec>,
    write_lock: Mutex<()>,
}

impl FileStudyDeploymentRepository {
    /// Open (and create if needed) a repository rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, codec: Arc<dyn SnapshotCodec>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            codec,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: DeploymentId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, self.codec.extension()))
    }

    async fn read_snapshot(&self, id: DeploymentId) -> Result<Option<DeploymentSnapshot>, RepositoryError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(path = %path.display(), "Read deployment snapshot");
                self.codec.decode(&bytes).map(Some)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StudyDeploymentRepository for FileStudyDeploymentRepository {
    async fn load(&self, id: DeploymentId) -> Result<Option<Versioned<StudyDeployment>>, RepositoryError> {
        Ok(self.read_snapshot(id).await?.map(|snapshot| Versioned {
            value: snapshot.deployment,
            version: snapshot.version,
        }))
    }

    async fn save(
        &self,
        deployment: &StudyDeployment,
        expected: ExpectedVersion,
    ) -> Result<u64, RepositoryError> {
        let _guard = self.write_lock.lock().await;

        let actual = self.read_snapshot(deployment.id).await?.map(|s| s.version);
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

        let version = expected.next();
        let snapshot = DeploymentSnapshot {
            version,
            deployment: deployment.clone(),
        };
        let bytes = self.codec.encode(&snapshot)?;

        let target = self.path_for(deployment.id);
        let temp = target.with_extension(format!("{}.tmp", self.codec.extension()));
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &target).await?;

        debug!(path = %target.display(), version, "Wrote deployment snapshot");
        Ok(version)
    }

    async fn list_ids(&self) -> Result<Vec<DeploymentId>, RepositoryError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.codec.extension()) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match DeploymentId::from_string(stem) {
                Ok(id) => ids.push(id),
                Err(_) => debug!(path = %path.display(), "Skipping file that is not a deployment snapshot"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
