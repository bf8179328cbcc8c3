//! Turning an instance ID into everything the hub needs to operate on that
//! tenant: a connected platform proxy, its configuration, a scoped span, and
//! its event history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info_span;

use drover_bus::MessageBus;
use drover_core::{InstanceId, Platform, ServiceIdSet};

use crate::history::{EventReadWriter, HistoryStore};

/// How long to wait for the instance's daemon to show up on the bus before
/// declaring it unavailable.
pub const PRESENCE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Services released automatically when new images appear.
    #[serde(default)]
    pub automated: ServiceIdSet,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, instance: &InstanceId) -> Result<Option<InstanceConfig>>;
}

/// In-memory configuration store; the durable one lives behind this trait.
#[derive(Default)]
pub struct MemConfigStore {
    configs: Mutex<HashMap<InstanceId, InstanceConfig>>,
}

impl MemConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: InstanceId, config: InstanceConfig) {
        self.configs.lock().unwrap().insert(instance, config);
    }
}

#[async_trait]
impl ConfigStore for MemConfigStore {
    async fn get_config(&self, instance: &InstanceId) -> Result<Option<InstanceConfig>> {
        Ok(self.configs.lock().unwrap().get(instance).cloned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("no configuration for instance {0}")]
    ConfigNotFound(InstanceId),
    #[error("platform unavailable for instance {0}: {1}")]
    PlatformUnavailable(InstanceId, String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One tenant's working set. The platform proxy's usefulness is bounded by
/// the daemon's bus subscription, not by this bundle.
pub struct Instance {
    pub id: InstanceId,
    pub platform: Arc<dyn Platform>,
    pub config: InstanceConfig,
    /// Span carrying the instance tag; enter it around work for this tenant.
    pub span: tracing::Span,
    pub events: EventReadWriter,
}

#[async_trait]
pub trait Instancer: Send + Sync {
    async fn get(&self, instance: &InstanceId) -> Result<Instance, InstanceError>;
}

pub struct MultitenantInstancer {
    pub bus: Arc<dyn MessageBus>,
    pub configs: Arc<dyn ConfigStore>,
    pub history: Arc<dyn HistoryStore>,
    pub presence_grace: Duration,
}

impl MultitenantInstancer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        configs: Arc<dyn ConfigStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        MultitenantInstancer { bus, configs, history, presence_grace: PRESENCE_GRACE }
    }
}

#[async_trait]
impl Instancer for MultitenantInstancer {
    async fn get(&self, instance: &InstanceId) -> Result<Instance, InstanceError> {
        let config = self
            .configs
            .get_config(instance)
            .await?
            .ok_or_else(|| InstanceError::ConfigNotFound(instance.clone()))?;

        self.bus
            .await_presence(instance, self.presence_grace)
            .await
            .map_err(|e| InstanceError::PlatformUnavailable(instance.clone(), e.to_string()))?;
        let platform = self
            .bus
            .connect(instance)
            .await
            .map_err(|e| InstanceError::PlatformUnavailable(instance.clone(), e.to_string()))?;

        Ok(Instance {
            id: instance.clone(),
            platform,
            config,
            span: info_span!("instance", id = %instance),
            events: EventReadWriter::new(instance.clone(), self.history.clone()),
        })
    }
}
