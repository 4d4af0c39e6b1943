// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Study protocols, device registrations and study deployments

pub mod device;
pub mod protocol;
pub mod consistency;
pub mod deployment;
pub mod events;
pub mod repository;
pub mod node_config;
