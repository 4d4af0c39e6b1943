// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Embedded runtime
//!
//! Wires the deployment service in-process from the node configuration.
//! Every CLI invocation builds one, runs a single command and exits, so
//! state only outlives the process with the file backend.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use fieldstudy_core::{
    application::StandardDeploymentService,
    domain::consistency::BuiltinDeviceCapabilities,
    domain::node_config::{NodeConfigManifest, StorageBackend},
    domain::repository::StudyDeploymentRepository,
    infrastructure::{
        codec::codec_for,
        event_bus::EventBus,
        repositories::{FileStudyDeploymentRepository, InMemoryStudyDeploymentRepository},
    },
};

pub struct EmbeddedRuntime {
    config: NodeConfigManifest,
    service: Arc<StandardDeploymentService>,
}

impl EmbeddedRuntime {
    /// Load configuration (explicit path or discovery) and build services.
    pub async fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = NodeConfigManifest::load_or_default(config_path)
            .context("Failed to load configuration")?;

        Self::from_config(config).await
    }

    pub async fn from_config(config: NodeConfigManifest) -> Result<Self> {
        config
            .validate()
            .context("Configuration validation failed")?;

        let storage = &config.spec.storage;
        let repository: Arc<dyn StudyDeploymentRepository> = match storage.backend {
            StorageBackend::InMemory => Arc::new(InMemoryStudyDeploymentRepository::new()),
            StorageBackend::File => Arc::new(
                FileStudyDeploymentRepository::open(&storage.path, codec_for(storage.codec))
                    .await
                    .with_context(|| {
                        format!("Failed to open deployment store at {}", storage.path.display())
                    })?,
            ),
        };
        debug!(backend = ?storage.backend, path = %storage.path.display(), "Deployment store ready");

        let event_bus = Arc::new(EventBus::new(config.spec.events.channel_capacity));
        let service = StandardDeploymentService::new(
            repository,
            Arc::new(BuiltinDeviceCapabilities),
            event_bus,
        )
        .with_max_conflict_retries(config.spec.concurrency.max_conflict_retries);

        Ok(Self {
            config,
            service: Arc::new(service),
        })
    }

    pub fn config(&self) -> &NodeConfigManifest {
        &self.config
    }

    pub fn service(&self) -> &Arc<StandardDeploymentService> {
        &self.service
    }
}
