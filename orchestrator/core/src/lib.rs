// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fieldstudy Orchestrator Core
//!
//! Study deployment state machine and device registration engine.
//!
//! # Architecture
//!
//! - **domain** - protocols, devices, the `StudyDeployment` aggregate, events,
//!   repository contracts and node configuration
//! - **application** - `DeploymentService`, the use-case boundary
//! - **infrastructure** - event bus, repositories, snapshot codecs, manifest parser

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
