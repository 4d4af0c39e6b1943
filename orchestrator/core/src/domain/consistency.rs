// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Consistency Checker
//!
//! Pure validation functions used by the study deployment aggregate:
//!
//! - [`validate_registration`] asks an injected [`DeviceCapabilityProvider`]
//!   whether a registration fits a device.
//! - [`compute_fingerprint`] hashes a device configuration snapshot so that
//!   re-issuing unchanged configuration yields the same value and any change
//!   yields a different one.
//!
//! Fingerprints are SHA-256 digests over a canonical JSON rendering of the
//! snapshot: object keys are sorted and every collection in the snapshot is
//! emitted in role/name/id order, so map iteration order never leaks into the
//! hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::domain::deployment::{DeploymentError, PrimaryDeviceDeployment};
use crate::domain::device::{DeviceDescriptor, DeviceRegistration, RegistrationValidity};

/// Source of per-device-kind registration rules.
///
/// Implementations are passed explicitly to the aggregate; there is no
/// process-wide registry of device types.
pub trait DeviceCapabilityProvider: Send + Sync {
    fn is_valid_registration(
        &self,
        device: &DeviceDescriptor,
        registration: &DeviceRegistration,
    ) -> RegistrationValidity;
}

/// Capability provider backed by the rules of the built-in [`DeviceKind`]s.
///
/// [`DeviceKind`]: crate::domain::device::DeviceKind
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDeviceCapabilities;

impl DeviceCapabilityProvider for BuiltinDeviceCapabilities {
    fn is_valid_registration(
        &self,
        device: &DeviceDescriptor,
        registration: &DeviceRegistration,
    ) -> RegistrationValidity {
        device.kind.is_valid_registration(registration)
    }
}

/// Check `registration` against `device`.
///
/// A blank device id is always rejected. `Unknown` verdicts are accepted so
/// that devices defined by newer protocol versions can still register.
pub fn validate_registration(
    capabilities: &dyn DeviceCapabilityProvider,
    device: &DeviceDescriptor,
    registration: &DeviceRegistration,
) -> Result<RegistrationValidity, DeploymentError> {
    if registration.device_id.trim().is_empty() {
        return Err(DeploymentError::InvalidRegistration {
            device: device.role_name.clone(),
            reason: "device id cannot be empty".to_string(),
        });
    }

    match capabilities.is_valid_registration(device, registration) {
        RegistrationValidity::Invalid(reason) => Err(DeploymentError::InvalidRegistration {
            device: device.role_name.clone(),
            reason,
        }),
        RegistrationValidity::Unknown => {
            tracing::debug!(
                device = %device.role_name,
                kind = device.kind.type_name(),
                "Registration validity unknown, accepting as-is"
            );
            Ok(RegistrationValidity::Unknown)
        }
        RegistrationValidity::Valid => Ok(RegistrationValidity::Valid),
    }
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Hex-encoded SHA-256 digest of an issued device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic, order-independent fingerprint of a configuration snapshot.
pub fn compute_fingerprint(snapshot: &PrimaryDeviceDeployment) -> Result<Fingerprint, DeploymentError> {
    let mut canonical = snapshot.clone();
    canonical.connected_devices.sort_by(|a, b| a.role_name.cmp(&b.role_name));
    canonical.tasks.sort_by(|a, b| a.name.cmp(&b.name));
    for task in &mut canonical.tasks {
        task.measures.sort();
    }
    canonical.task_controls.sort();

    let value = serde_json::to_value(&canonical)
        .map_err(|e| DeploymentError::Snapshot(e.to_string()))?;
    let bytes = serde_json::to_vec(&sort_keys(value))
        .map_err(|e| DeploymentError::Snapshot(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Rebuild every object with its keys in sorted order, independent of how
/// `serde_json::Map` is backed.
fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}
