//! The release context: everything a release needs in one place, plus the
//! selection of updateable services.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use drover_core::{
    Cluster, ContainerUpdate, Registry, ReleaseResult, Service, ServiceId, ServiceIdSet,
    ServiceResult,
};
use drover_workspace::{Repo, Workspace};

/// Manifest annotation marking a service as not-to-be-released.
pub const LOCKED_ANNOTATION: &str = "drover.dev/locked";

/// The working record carried through a release for one service.
#[derive(Debug, Clone)]
pub struct ServiceUpdate {
    pub service_id: ServiceId,
    pub manifest_path: PathBuf,
    pub manifest_bytes: Vec<u8>,
    /// The service as observed in the running cluster; populated during
    /// selection.
    pub service: Option<Service>,
    /// Per-container image moves; populated during planning.
    pub updates: Vec<ContainerUpdate>,
}

pub struct ReleaseContext {
    pub cluster: Arc<dyn Cluster>,
    pub registry: Arc<dyn Registry>,
    repo: Repo,
    workspace: Option<Workspace>,
}

impl ReleaseContext {
    pub fn new(cluster: Arc<dyn Cluster>, registry: Arc<dyn Registry>, repo: Repo) -> Self {
        ReleaseContext { cluster, registry, repo, workspace: None }
    }

    pub async fn clone_repo(&mut self) -> Result<()> {
        let repo = self.repo.clone();
        let workspace = tokio::task::spawn_blocking(move || repo.clone_scratch())
            .await
            .context("joining clone task")??;
        self.workspace = Some(workspace);
        Ok(())
    }

    pub fn workspace(&self) -> Result<&Workspace> {
        self.workspace.as_ref().ok_or_else(|| anyhow!("repository has not been cloned"))
    }

    pub fn manifest_dir(&self) -> Result<PathBuf> {
        self.workspace()?.manifest_dir()
    }

    /// Remove the scratch clone. Safe on a context that never cloned.
    pub fn clean(&mut self) {
        if let Some(mut ws) = self.workspace.take() {
            ws.clean();
        }
    }

    /// The services defined by manifest files in the working copy. Exactly
    /// one file per service is an invariant of the repository; violating it
    /// is a fatal planning error.
    pub fn find_defined_services(&self) -> Result<Vec<ServiceUpdate>> {
        let dir = self.manifest_dir()?;
        let files = self.cluster.find_defined_services(&dir)?;

        let mut defined = Vec::new();
        for (id, paths) in files {
            match paths.as_slice() {
                [path] => {
                    let bytes =
                        fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                    defined.push(ServiceUpdate {
                        service_id: id,
                        manifest_path: path.clone(),
                        manifest_bytes: bytes,
                        service: None,
                        updates: vec![],
                    });
                }
                _ => bail!(
                    "multiple resource files found for service {}: {}",
                    id,
                    paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
                ),
            }
        }
        Ok(defined)
    }

    /// Find the services that exist both in the definition files and the
    /// running cluster. With an explicit `included` list, only those services
    /// are considered and missing ones are recorded as skipped; without one,
    /// every defined service is considered and those not running are ignored.
    /// Locked and excluded services are recorded as skipped. Returns the
    /// potentially updateable services in service ID order.
    pub async fn select_services(
        &self,
        defined: Vec<ServiceUpdate>,
        included: Option<&[ServiceId]>,
        locked: &ServiceIdSet,
        excluded: &ServiceIdSet,
        results: &mut ReleaseResult,
    ) -> Result<Vec<ServiceUpdate>> {
        let only: Option<ServiceIdSet> = included.map(|ids| ids.iter().cloned().collect());

        let mut update_map: BTreeMap<ServiceId, ServiceUpdate> = BTreeMap::new();
        for s in defined {
            if let Some(only) = &only {
                if !only.contains(&s.service_id) {
                    continue;
                }
            }
            let id = s.service_id.clone();
            if excluded.contains(&id) {
                results.insert(id, ServiceResult::skipped("excluded"));
            } else if locked.contains(&id) {
                results.insert(id, ServiceResult::skipped("locked"));
            } else {
                results.insert(id.clone(), ServiceResult::pending());
                update_map.insert(id, s);
            }
        }

        // Correlate with the running system.
        let ids: Vec<ServiceId> = update_map.keys().cloned().collect();
        let services = self.cluster.some_services(&ids).await?;

        let mut updates = Vec::new();
        for service in services {
            if let Some(mut update) = update_map.remove(&service.id) {
                update.service = Some(service);
                updates.push(update);
            }
        }

        // Anything left over is defined but not running. An explicit request
        // gets an accounting entry per ID; a bulk request drops it quietly.
        for id in update_map.into_keys() {
            let result = if only.is_some() {
                ServiceResult::skipped("not in running system")
            } else {
                ServiceResult::ignored("not in running system")
            };
            results.insert(id, result);
        }

        updates.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(updates)
    }

    /// Write the rewritten manifests back, preserving each file's mode, then
    /// commit and push. A push failure leaves the working directory in place
    /// for diagnosis; cleaning up stays with the caller.
    pub async fn push_changes(&self, updates: &[ServiceUpdate], message: String) -> Result<()> {
        let files: Vec<(PathBuf, Vec<u8>)> = updates
            .iter()
            .map(|u| (u.manifest_path.clone(), u.manifest_bytes.clone()))
            .collect();
        let workspace = self.workspace()?.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            write_updates(&files)?;
            workspace.commit_and_push(&message)?;
            Ok(())
        })
        .await
        .context("joining push task")?
    }

    /// Hash of the working copy's HEAD commit.
    pub async fn head_hash(&self) -> Result<String> {
        let workspace = self.workspace()?.clone();
        tokio::task::spawn_blocking(move || workspace.head_hash())
            .await
            .context("joining head task")?
    }
}

fn write_updates(files: &[(PathBuf, Vec<u8>)]) -> Result<()> {
    for (path, bytes) in files {
        let mode = fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .permissions();
        fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        fs::set_permissions(path, mode)
            .with_context(|| format!("restoring mode of {}", path.display()))?;
        debug!(path = %path.display(), "wrote rewritten manifest");
    }
    Ok(())
}

/// Services whose manifest carries the locked annotation.
pub fn locked_services(defined: &[ServiceUpdate]) -> ServiceIdSet {
    let mut locked = ServiceIdSet::new();
    for update in defined {
        if manifest_is_locked(&update.manifest_bytes) {
            locked.add([update.service_id.clone()]);
        }
    }
    locked
}

fn manifest_is_locked(bytes: &[u8]) -> bool {
    let doc: serde_yaml::Value = match serde_yaml::from_slice(bytes) {
        Ok(doc) => doc,
        Err(_) => return false,
    };
    doc.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(LOCKED_ANNOTATION))
        .and_then(|v| v.as_str())
        == Some("true")
}
