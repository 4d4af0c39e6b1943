// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod deployment_service;

// Re-export use cases for convenience
pub use deployment_service::{DeploymentService, DeploymentServiceError, StandardDeploymentService};
