//! The serialised sync queue. A single task owns the applier and executes
//! batches one at a time; producers enqueue a batch and await its reply.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use drover_core::{SyncDef, SyncError};

use crate::manifests::{definition_obj, ApiObject};

const FIELD_MANAGER: &str = "drover";

pub struct SyncRequest {
    pub def: SyncDef,
    pub reply: oneshot::Sender<Result<(), SyncError>>,
}

/// Spawn the queue consumer. Senders get one reply per submission; dropping
/// the returned sender shuts the loop down.
pub fn spawn_sync_loop(client: Client) -> mpsc::Sender<SyncRequest> {
    let (tx, mut rx) = mpsc::channel::<SyncRequest>(16);
    tokio::spawn(async move {
        let mut applier = Applier::new(client);
        while let Some(request) = rx.recv().await {
            let t0 = std::time::Instant::now();
            let result = applier.run(request.def).await;
            histogram!("cluster_sync_ms", t0.elapsed().as_secs_f64() * 1000.0);
            let _ = request.reply.send(result);
        }
        info!("sync loop stopped");
    });
    tx
}

/// Applies and deletes definitions through the API server, resolving each
/// definition's kind via discovery. Owned by the sync loop, so lookups cache
/// without locking.
struct Applier {
    client: Client,
    discovery_cache: HashMap<String, (ApiResource, bool)>,
}

impl Applier {
    fn new(client: Client) -> Self {
        Applier { client, discovery_cache: HashMap::new() }
    }

    async fn run(&mut self, def: SyncDef) -> Result<(), SyncError> {
        let mut errs: BTreeMap<String, String> = BTreeMap::new();
        for action in def.actions {
            if !action.delete.is_empty() {
                if is_addon_definition(&action.delete) {
                    warn!(resource = %action.resource_id, "refusing to touch an addon resource");
                    continue;
                }
                if let Err(err) = self.delete(&action.delete).await {
                    warn!(resource = %action.resource_id, error = %format!("{:#}", err), "delete failed");
                    counter!("cluster_sync_errors_total", 1u64);
                    errs.insert(action.resource_id.clone(), format!("{:#}", err));
                    continue;
                }
            }
            if !action.apply.is_empty() {
                if is_addon_definition(&action.apply) {
                    warn!(resource = %action.resource_id, "refusing to touch an addon resource");
                    continue;
                }
                if let Err(err) = self.apply(&action.apply).await {
                    warn!(resource = %action.resource_id, error = %format!("{:#}", err), "apply failed");
                    counter!("cluster_sync_errors_total", 1u64);
                    errs.insert(action.resource_id.clone(), format!("{:#}", err));
                    continue;
                }
            }
            counter!("cluster_sync_actions_total", 1u64);
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Resources(errs))
        }
    }

    async fn apply(&mut self, definition: &[u8]) -> Result<()> {
        let obj = definition_obj(definition)?;
        let api = self.dynamic_api(&obj).await?;
        let yaml: serde_yaml::Value =
            serde_yaml::from_slice(definition).context("parsing definition YAML")?;
        let json = serde_json::to_value(yaml).context("converting definition to JSON")?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&obj.metadata.name, &pp, &Patch::Apply(&json))
            .await
            .with_context(|| format!("applying {}/{}", obj.namespace(), obj.metadata.name))?;
        Ok(())
    }

    async fn delete(&mut self, definition: &[u8]) -> Result<()> {
        let obj = definition_obj(definition)?;
        let api = self.dynamic_api(&obj).await?;
        match api.delete(&obj.metadata.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Deleting something already gone is the desired end state.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("deleting {}/{}", obj.namespace(), obj.metadata.name))
            }
        }
    }

    async fn dynamic_api(&mut self, obj: &ApiObject) -> Result<Api<DynamicObject>> {
        let gvk = gvk_of(&obj.api_version, &obj.kind);
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        let api = if namespaced {
            Api::namespaced_with(self.client.clone(), obj.namespace(), &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }

    async fn find_api_resource(&mut self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(hit) = self.discovery_cache.get(&key) {
            return Ok(hit.clone());
        }
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    self.discovery_cache.insert(key, (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}

/// Addon resources are managed out-of-band and are not sync-eligible.
fn is_addon_definition(definition: &[u8]) -> bool {
    match definition_obj(definition) {
        Ok(obj) => crate::is_addon(Some(obj.namespace()), &obj.labels()),
        Err(_) => false,
    }
}

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind { group, version, kind: kind.to_string() }
}
