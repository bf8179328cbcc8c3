//! Job handlers: running a release against an instance's daemon, and fanning
//! automated instances out into release jobs.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{warn, Instrument};

use drover_core::{
    Event, EventKind, EventWriter, ImageSelector, LogLevel, ReleaseEventMetadata, ReleaseKind,
    ReleaseSpec, ServiceSelector,
};

use crate::instance::{ConfigStore, Instancer};
use crate::jobs::{Job, JobHandler, JobParams, JobStore};

/// Invoke the instance's daemon once with the release spec and record what
/// came back: the per-service result lands on the job, and a history event is
/// appended for the tenant.
pub struct ReleaseHandler {
    pub instancer: Arc<dyn Instancer>,
}

#[async_trait]
impl JobHandler for ReleaseHandler {
    async fn handle(&self, job: &mut Job) -> Result<()> {
        let spec = match &job.params {
            JobParams::Release(spec) => spec.clone(),
            _ => bail!("job {} is not a release job", job.id),
        };

        let instance = self.instancer.get(&job.instance).await?;
        let started_at = Utc::now();
        let result = instance
            .platform
            .update_images(spec.clone())
            .instrument(instance.span.clone())
            .await
            .context("invoking release on the daemon")?;
        job.result = Some(result.clone());

        let event = Event {
            service_ids: result.service_ids(),
            kind: EventKind::Release,
            started_at,
            ended_at: Utc::now(),
            log_level: LogLevel::Info,
            metadata: Some(ReleaseEventMetadata { spec, result, error: String::new() }),
        };
        // The release happened; a history hiccup must not fail the job.
        if let Err(err) = instance.events.log_event(event).await {
            warn!(instance = %job.instance, error = %format!("{:#}", err), "failed to append history event");
        }
        Ok(())
    }
}

/// Turn an automated-instance job into a release job covering the instance's
/// automated services.
pub struct AutomatedInstanceHandler {
    pub configs: Arc<dyn ConfigStore>,
    pub store: Arc<dyn JobStore>,
}

#[async_trait]
impl JobHandler for AutomatedInstanceHandler {
    async fn handle(&self, job: &mut Job) -> Result<()> {
        if !matches!(job.params, JobParams::AutomatedInstance) {
            bail!("job {} is not an automated-instance job", job.id);
        }
        let config = self
            .configs
            .get_config(&job.instance)
            .await?
            .with_context(|| format!("no configuration for instance {}", job.instance))?;
        if config.automated.is_empty() {
            return Ok(());
        }

        let spec = ReleaseSpec {
            services: ServiceSelector::Specific(config.automated.iter().cloned().collect()),
            image: ImageSelector::LatestForAll,
            kind: ReleaseKind::Execute,
            excludes: vec![],
        };
        self.store.enqueue(Job::release(job.instance.clone(), spec)).await?;
        Ok(())
    }
}
