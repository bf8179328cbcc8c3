//! In-process transport with the same semantics as the NATS bus: at most one
//! subscriber per instance, kick arbitration, unavailable when absent, and
//! teardown on fatal errors. Used for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use drover_core::{InstanceId, Platform, PlatformError, PlatformResult};

use crate::MessageBus;

struct Subscription {
    platform: Arc<dyn Platform>,
    done: mpsc::Sender<Option<PlatformError>>,
}

type Subscriptions = Arc<Mutex<HashMap<InstanceId, Subscription>>>;

#[derive(Default)]
pub struct StandaloneBus {
    subscriptions: Subscriptions,
}

impl StandaloneBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for StandaloneBus {
    async fn connect(&self, instance: &InstanceId) -> PlatformResult<Arc<dyn Platform>> {
        Ok(Arc::new(StandalonePlatform {
            subscriptions: self.subscriptions.clone(),
            instance: instance.clone(),
        }))
    }

    async fn subscribe(
        &self,
        instance: &InstanceId,
        platform: Arc<dyn Platform>,
        done: mpsc::Sender<Option<PlatformError>>,
    ) {
        let id = Uuid::new_v4().to_string();
        let previous = self
            .subscriptions
            .lock()
            .unwrap()
            .insert(instance.clone(), Subscription { platform, done });
        if let Some(previous) = previous {
            counter!("bus_kicks_total", 1u64);
            debug!(instance = %instance, "kicking previous subscriber");
            let _ = previous
                .done
                .try_send(Some(PlatformError::Fatal(format!("Kicked by new subscriber {}", id))));
        }
    }

    async fn ping(&self, instance: &InstanceId) -> PlatformResult<()> {
        self.connect(instance).await?.ping().await
    }
}

/// Proxy that resolves the live subscription at call time, so its lifetime is
/// bounded by the subscription and not by whoever holds the proxy.
struct StandalonePlatform {
    subscriptions: Subscriptions,
    instance: InstanceId,
}

impl StandalonePlatform {
    fn lookup(&self) -> PlatformResult<Arc<dyn Platform>> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&self.instance)
            .map(|s| s.platform.clone())
            .ok_or_else(|| {
                PlatformError::Unavailable(format!("no daemon for instance {}", self.instance))
            })
    }

    /// A fatal error means the daemon's connection is dead: drop the
    /// subscription and let the daemon know why.
    fn check<T>(&self, result: PlatformResult<T>) -> PlatformResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                if let Some(sub) = self.subscriptions.lock().unwrap().remove(&self.instance) {
                    let _ = sub.done.try_send(Some(err.clone()));
                }
            }
        }
        result
    }
}

#[async_trait]
impl Platform for StandalonePlatform {
    async fn ping(&self) -> PlatformResult<()> {
        let platform = self.lookup()?;
        self.check(platform.ping().await)
    }

    async fn version(&self) -> PlatformResult<String> {
        let platform = self.lookup()?;
        self.check(platform.version().await)
    }

    async fn export(&self) -> PlatformResult<Vec<u8>> {
        let platform = self.lookup()?;
        self.check(platform.export().await)
    }

    async fn list_services(
        &self,
        namespace: Option<String>,
    ) -> PlatformResult<Vec<drover_core::ServiceStatus>> {
        let platform = self.lookup()?;
        self.check(platform.list_services(namespace).await)
    }

    async fn list_images(
        &self,
        services: drover_core::ServiceSpec,
    ) -> PlatformResult<Vec<drover_core::ImageStatus>> {
        let platform = self.lookup()?;
        self.check(platform.list_images(services).await)
    }

    async fn update_images(
        &self,
        spec: drover_core::ReleaseSpec,
    ) -> PlatformResult<drover_core::ReleaseResult> {
        let platform = self.lookup()?;
        self.check(platform.update_images(spec).await)
    }

    async fn sync_cluster(&self) -> PlatformResult<()> {
        let platform = self.lookup()?;
        self.check(platform.sync_cluster().await)
    }

    async fn sync_status(&self, reference: String) -> PlatformResult<Vec<String>> {
        let platform = self.lookup()?;
        self.check(platform.sync_status(reference).await)
    }
}
