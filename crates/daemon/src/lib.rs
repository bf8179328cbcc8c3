//! The daemon facade: the Platform capability set implemented against the
//! cluster adapter, registry and release engine, with release events recorded
//! along the way.

#![forbid(unsafe_code)]

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tracing::{debug, info, warn};

use drover_core::{
    Cluster, ContainerStatus, Event, EventKind, EventWriter, ImageDescription, ImageId,
    ImageStatus, LogLevel, Platform, PlatformError, PlatformResult, Registry, ReleaseEventMetadata,
    ReleaseResult, ReleaseSpec, Service, ServiceSpec, ServiceStatus, SyncAction, SyncDef,
    SyncError,
};
use drover_release::{release, ReleaseContext};
use drover_workspace::Repo;

pub struct Daemon {
    pub version: String,
    pub cluster: Arc<dyn Cluster>,
    pub registry: Arc<dyn Registry>,
    pub repo: Repo,
    pub events: Arc<dyn EventWriter>,
    /// Branch head recorded by the last successful reconcile or release;
    /// sync-status is answered relative to this.
    last_applied: tokio::sync::RwLock<Option<String>>,
}

impl Daemon {
    pub fn new(
        version: String,
        cluster: Arc<dyn Cluster>,
        registry: Arc<dyn Registry>,
        repo: Repo,
        events: Arc<dyn EventWriter>,
    ) -> Self {
        Daemon { version, cluster, registry, repo, events, last_applied: Default::default() }
    }

    fn release_context(&self) -> ReleaseContext {
        ReleaseContext::new(self.cluster.clone(), self.registry.clone(), self.repo.clone())
    }

    /// Record the release in the event log. A logging failure must never mask
    /// what the release itself did: a failed release returns its own error
    /// regardless, and a successful one stays successful with the logging
    /// error dropped here.
    async fn log_release(
        &self,
        spec: &ReleaseSpec,
        outcome: &Result<ReleaseResult, PlatformError>,
        started_at: chrono::DateTime<Utc>,
    ) {
        let (result, error, log_level) = match outcome {
            Ok(result) => (result.clone(), String::new(), LogLevel::Info),
            Err(err) => (ReleaseResult::new(), err.to_string(), LogLevel::Error),
        };
        let event = Event {
            service_ids: result.service_ids(),
            kind: EventKind::Release,
            started_at,
            ended_at: Utc::now(),
            log_level,
            metadata: Some(ReleaseEventMetadata { spec: spec.clone(), result, error }),
        };
        if let Err(err) = self.events.log_event(event).await {
            warn!(error = %format!("{:#}", err), "failed to record release event");
        }
    }

    async fn sync_from_workspace(&self, ctx: &mut ReleaseContext) -> anyhow::Result<()> {
        ctx.clone_repo().await?;
        let defined = ctx.find_defined_services()?;
        let head = ctx.head_hash().await?;
        let def = SyncDef {
            actions: defined
                .into_iter()
                .map(|d| SyncAction {
                    resource_id: d.service_id.to_string(),
                    apply: d.manifest_bytes,
                    delete: vec![],
                })
                .collect(),
        };
        let count = def.actions.len();
        match ctx.cluster.sync(def).await {
            Ok(()) => {
                *self.last_applied.write().await = Some(head.clone());
                info!(resources = count, head = %head, "cluster reconciled");
                Ok(())
            }
            Err(err @ SyncError::Resources(_)) => {
                counter!("sync_failures_total", 1u64);
                Err(err.into())
            }
            Err(err @ SyncError::Aborted(_)) => Err(err.into()),
        }
    }
}

fn remote_err(err: anyhow::Error) -> PlatformError {
    PlatformError::Remote(format!("{:#}", err))
}

/// Parse a running container's image, skipping containers whose image
/// reference we cannot make sense of.
fn container_statuses(service: &Service) -> Vec<ContainerStatus> {
    service
        .containers_or_none()
        .iter()
        .filter_map(|c| match c.image.parse::<ImageId>() {
            Ok(id) => Some(ContainerStatus {
                name: c.name.clone(),
                current: ImageDescription { id, created_at: None },
                available: vec![],
            }),
            Err(err) => {
                debug!(container = %c.name, error = %err, "skipping container with unparseable image");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Platform for Daemon {
    async fn ping(&self) -> PlatformResult<()> {
        self.cluster.ping().await.map_err(remote_err)
    }

    async fn version(&self) -> PlatformResult<String> {
        Ok(self.version.clone())
    }

    async fn export(&self) -> PlatformResult<Vec<u8>> {
        self.cluster.export().await.map_err(remote_err)
    }

    async fn list_services(
        &self,
        namespace: Option<String>,
    ) -> PlatformResult<Vec<ServiceStatus>> {
        let services =
            self.cluster.all_services(namespace.as_deref()).await.map_err(remote_err)?;
        Ok(services
            .iter()
            .map(|s| ServiceStatus {
                id: s.id.clone(),
                containers: container_statuses(s),
                status: s.status.clone(),
            })
            .collect())
    }

    async fn list_images(&self, services: ServiceSpec) -> PlatformResult<Vec<ImageStatus>> {
        let services = match services {
            ServiceSpec::All => self.cluster.all_services(None).await,
            ServiceSpec::Id(id) => self.cluster.some_services(&[id]).await,
        }
        .map_err(remote_err)?;

        let images = drover_release::collect_available_images(self.registry.as_ref(), &services)
            .await
            .map_err(remote_err)?;

        Ok(services
            .iter()
            .map(|s| ImageStatus {
                id: s.id.clone(),
                containers: container_statuses(s)
                    .into_iter()
                    .map(|mut c| {
                        c.available = images.available(&c.current.id.repository_key()).to_vec();
                        c
                    })
                    .collect(),
            })
            .collect())
    }

    async fn update_images(&self, spec: ReleaseSpec) -> PlatformResult<ReleaseResult> {
        let started_at = Utc::now();
        counter!("daemon_releases_total", 1u64);

        let mut ctx = self.release_context();
        let outcome = release(&mut ctx, &spec).await.map_err(remote_err);
        if outcome.is_ok() {
            if let Ok(head) = ctx.head_hash().await {
                *self.last_applied.write().await = Some(head);
            }
        }
        ctx.clean();

        self.log_release(&spec, &outcome, started_at).await;
        outcome
    }

    async fn sync_cluster(&self) -> PlatformResult<()> {
        let mut ctx = self.release_context();
        let result = self.sync_from_workspace(&mut ctx).await;
        ctx.clean();
        result.map_err(remote_err)
    }

    async fn sync_status(&self, reference: String) -> PlatformResult<Vec<String>> {
        let repo = self.repo.clone();
        let applied = self.last_applied.read().await.clone();
        tokio::task::spawn_blocking(move || {
            let workspace = repo.clone_scratch()?;
            workspace.pending_commits(&reference, applied.as_deref())
        })
        .await
        .map_err(|e| PlatformError::Remote(e.to_string()))?
        .map_err(remote_err)
    }
}

/// Event writer that records into the process log only. Stands in where no
/// durable event store is wired to the daemon.
pub struct LoggingEventWriter;

#[async_trait]
impl EventWriter for LoggingEventWriter {
    async fn log_event(&self, event: Event) -> anyhow::Result<()> {
        info!(
            kind = ?event.kind,
            services = %event.service_ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            level = ?event.log_level,
            "release event"
        );
        Ok(())
    }
}
