// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot codecs for persisted deployments.
//!
//! The file repository takes a codec by injection; nothing in the storage
//! path looks up formats by name at runtime beyond [`codec_for`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::deployment::StudyDeployment;
use crate::domain::node_config::SnapshotFormat;
use crate::domain::repository::RepositoryError;

/// A deployment as written to storage, tagged with its version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub version: u64,
    pub deployment: StudyDeployment,
}

pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, snapshot: &DeploymentSnapshot) -> Result<Vec<u8>, RepositoryError>;

    fn decode(&self, bytes: &[u8]) -> Result<DeploymentSnapshot, RepositoryError>;

    /// File extension, without the dot.
    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSnapshotCodec;

impl SnapshotCodec for JsonSnapshotCodec {
    fn encode(&self, snapshot: &DeploymentSnapshot) -> Result<Vec<u8>, RepositoryError> {
        serde_json::to_vec_pretty(snapshot).map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DeploymentSnapshot, RepositoryError> {
        serde_json::from_slice(bytes).map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSnapshotCodec;

impl SnapshotCodec for YamlSnapshotCodec {
    fn encode(&self, snapshot: &DeploymentSnapshot) -> Result<Vec<u8>, RepositoryError> {
        serde_yaml::to_string(snapshot)
            .map(String::into_bytes)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DeploymentSnapshot, RepositoryError> {
        serde_yaml::from_slice(bytes).map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    fn extension(&self) -> &'static str {
        "yaml"
    }
}

pub fn codec_for(format: SnapshotFormat) -> Arc<dyn SnapshotCodec> {
    match format {
        SnapshotFormat::Json => Arc::new(JsonSnapshotCodec),
        SnapshotFormat::Yaml => Arc::new(YamlSnapshotCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{DeviceDescriptor, DeviceKind, RoleName};
    use crate::domain::protocol::StudyProtocol;

    fn snapshot() -> DeploymentSnapshot {
        let mut protocol = StudyProtocol::new("single-phone");
        protocol
            .add_primary_device(DeviceDescriptor::primary(
                RoleName::new("Phone").unwrap(),
                DeviceKind::Smartphone,
            ))
            .unwrap();
        DeploymentSnapshot {
            version: 3,
            deployment: StudyDeployment::new(protocol).unwrap(),
        }
    }

    #[test]
    fn test_codecs_preserve_deployment() {
        let original = snapshot();
        for format in [SnapshotFormat::Json, SnapshotFormat::Yaml] {
            let codec = codec_for(format);
            let bytes = codec.encode(&original).unwrap();
            let decoded = codec.decode(&bytes).unwrap();
            assert_eq!(decoded.version, 3);
            assert_eq!(decoded.deployment.id, original.deployment.id);
            assert_eq!(decoded.deployment.get_status(), original.deployment.get_status());
        }
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let result = JsonSnapshotCodec.decode(b"{ not json");
        assert!(matches!(result, Err(RepositoryError::Serialization(_))));
    }
}
