//! The release engine: given a release spec, compute a deterministic set of
//! manifest edits, correlate them with the running cluster, commit them, and
//! apply them, reporting a per-service outcome throughout.

#![forbid(unsafe_code)]

mod context;
mod images;

pub use context::{locked_services, ReleaseContext, ServiceUpdate, LOCKED_ANNOTATION};
pub use images::{collect_available_images, ImageMap};

use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use tracing::{info, warn};

use drover_core::{
    ContainerUpdate, ImageId, ImageSelector, ReleaseKind, ReleaseResult, ReleaseSpec,
    ReleaseStatus, ServiceId, ServiceIdSet, ServiceResult, ServiceSelector, SyncAction, SyncDef,
    SyncError,
};

/// Run a release to completion. Per-service failures are recorded in the
/// result and never abort the release; only errors that invalidate the whole
/// plan (clone failure, duplicate manifests, a dead sync queue) surface as
/// `Err`. The scratch clone is left in place either way; cleaning it up is
/// the caller's job.
pub async fn release(ctx: &mut ReleaseContext, spec: &ReleaseSpec) -> Result<ReleaseResult> {
    let t0 = Instant::now();
    counter!("release_total", 1u64);
    let mut results = ReleaseResult::new();

    ctx.clone_repo().await.context("cloning manifest repository")?;

    // Select: who is even a candidate.
    let defined = ctx.find_defined_services()?;
    let locked = locked_services(&defined);
    let excluded: ServiceIdSet = spec.excludes.iter().cloned().collect();
    let included: Option<Vec<ServiceId>> = match &spec.services {
        ServiceSelector::All => None,
        ServiceSelector::Specific(ids) => Some(ids.clone()),
    };
    let mut updates = ctx
        .select_services(defined, included.as_deref(), &locked, &excluded, &mut results)
        .await?;
    info!(candidates = updates.len(), "release: selected services");

    // Plan: resolve the target image per container.
    plan_updates(ctx, &mut updates, &spec.image, &mut results).await?;
    info!(planned = updates.len(), "release: planned updates");

    // Rewrite: run each changed manifest through the cluster's rewriter. The
    // rewriter's output is carried byte-for-byte from here on.
    updates.retain_mut(|update| {
        for change in update.updates.clone() {
            match ctx.cluster.update_definition(&update.manifest_bytes, &change.target) {
                Ok(bytes) => update.manifest_bytes = bytes,
                Err(err) => {
                    warn!(service = %update.service_id, error = %format!("{:#}", err), "rewrite failed");
                    counter!("release_rewrite_errors_total", 1u64);
                    results.insert(
                        update.service_id.clone(),
                        ServiceResult::failed(&format!("{:#}", err)),
                    );
                    return false;
                }
            }
        }
        true
    });

    if spec.kind == ReleaseKind::PlanOnly {
        finalize_success(&mut results, &updates);
        info!(took_ms = %t0.elapsed().as_millis(), "release: plan-only, no side effects");
        return Ok(results);
    }

    // Commit: write the rewritten manifests and push a single commit. No
    // writes means no commit.
    if !updates.is_empty() {
        let message = commit_message(spec, &updates);
        ctx.push_changes(&updates, message).await.context("pushing changes")?;
        info!("release: committed and pushed");
    }

    // Apply: one batch over the serialised sync queue; resource-level errors
    // come back per service.
    if !updates.is_empty() {
        let def = SyncDef {
            actions: updates
                .iter()
                .map(|u| SyncAction {
                    resource_id: u.service_id.to_string(),
                    apply: u.manifest_bytes.clone(),
                    delete: vec![],
                })
                .collect(),
        };
        match ctx.cluster.sync(def).await {
            Ok(()) => {}
            Err(SyncError::Resources(errs)) => {
                for (resource_id, message) in &errs {
                    counter!("release_apply_errors_total", 1u64);
                    let id = ServiceId::from_str(resource_id)
                        .map_err(|e| anyhow!("sync reported an unparseable resource: {}", e))?;
                    results.insert(id, ServiceResult::failed(message));
                }
            }
            Err(err @ SyncError::Aborted(_)) => return Err(err.into()),
        }
    }

    finalize_success(&mut results, &updates);
    histogram!("release_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(services = results.len(), took_ms = %t0.elapsed().as_millis(), "release: done");
    Ok(results)
}

/// Resolve the desired image per container for each pending update. Updates
/// with nothing to change are recorded as skipped and dropped.
async fn plan_updates(
    ctx: &ReleaseContext,
    updates: &mut Vec<ServiceUpdate>,
    image: &ImageSelector,
    results: &mut ReleaseResult,
) -> Result<()> {
    let image_map = match image {
        ImageSelector::LatestForAll => {
            let services: Vec<_> =
                updates.iter().filter_map(|u| u.service.clone()).collect();
            Some(collect_available_images(ctx.registry.as_ref(), &services).await?)
        }
        ImageSelector::Specific(_) => None,
    };

    updates.retain_mut(|update| {
        let service = match update.service.as_ref() {
            Some(s) => s,
            None => return false,
        };
        for container in service.containers_or_none() {
            let current = match ImageId::from_str(&container.image) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let target = match image {
                ImageSelector::Specific(img) if current.same_repository(img) => Some(img.clone()),
                ImageSelector::Specific(_) => None,
                ImageSelector::LatestForAll => image_map
                    .as_ref()
                    .and_then(|m| m.latest_image(&current.repository_key()))
                    .map(|d| d.id.clone()),
            };
            if let Some(target) = target {
                if target != current {
                    update.updates.push(ContainerUpdate {
                        container: container.name.clone(),
                        current,
                        target,
                    });
                }
            }
        }
        if update.updates.is_empty() {
            results.insert(update.service_id.clone(), ServiceResult::skipped("no change"));
            false
        } else {
            true
        }
    });
    Ok(())
}

/// Mark every update that didn't fail along the way as a success, carrying
/// its per-container changes. No result is ever left pending.
fn finalize_success(results: &mut ReleaseResult, updates: &[ServiceUpdate]) {
    for update in updates {
        if let Some(existing) = results.get(&update.service_id) {
            if existing.status == ReleaseStatus::Failed {
                continue;
            }
        }
        results.insert(
            update.service_id.clone(),
            ServiceResult {
                status: ReleaseStatus::Success,
                error: String::new(),
                updates: update.updates.clone(),
            },
        );
    }
}

/// A single human-readable line for the manifest commit.
pub fn commit_message(spec: &ReleaseSpec, updates: &[ServiceUpdate]) -> String {
    let image = match &spec.image {
        ImageSelector::Specific(id) => id.to_string(),
        ImageSelector::LatestForAll => "all latest images".to_string(),
    };
    let services: Vec<String> = updates.iter().map(|u| u.service_id.to_string()).collect();
    let services = if services.is_empty() { "all services".to_string() } else { services.join(", ") };
    format!("Release {} to {}", image, services)
}
