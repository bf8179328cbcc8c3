//! Kubernetes cluster adapter: service enumeration with controller matching,
//! addon filtering, stable-order export, and serialised apply/delete.

#![forbid(unsafe_code)]

mod controllers;
mod manifests;
mod sync;

pub use manifests::{definition_obj, find_defined_services, update_definition, ApiObject};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, ReplicationController, Service as K8sService};
use kube::{api::ListParams, Api, Client, Resource, ResourceExt};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use drover_core::{
    Cluster, ContainersOrExcuse, ImageId, Service, ServiceId, SyncDef, SyncError, STATUS_UNKNOWN,
};

use controllers::{match_controller, PodController};
use sync::{spawn_sync_loop, SyncRequest};

/// Kubernetes has "add-ons": manifests applied out-of-band on the master.
/// They live in `kube-system` and carry one of the labels below; the add-on
/// manager owns them and attempts to control them via other means will fail,
/// so they are invisible to every query and never sync-eligible.
pub(crate) fn is_addon(namespace: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
    if namespace != Some("kube-system") {
        return false;
    }
    labels.get("kubernetes.io/cluster-service").map(String::as_str) == Some("true")
        || matches!(
            labels.get("addonmanager.kubernetes.io/mode").map(String::as_str),
            Some("EnsureExists") | Some("Reconcile")
        )
}

fn resource_is_addon<K: kube::Resource>(obj: &K) -> bool {
    is_addon(obj.meta().namespace.as_deref(), obj.labels())
}

/// A handle to a Kubernetes API server. Mutating operations are serialised
/// through a single action queue so no two applies interleave and error
/// accounting stays deterministic.
pub struct KubeCluster {
    client: Client,
    actions: mpsc::Sender<SyncRequest>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        let actions = spawn_sync_loop(client.clone());
        KubeCluster { client, actions }
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("getting namespaces")?;
        let mut names: Vec<String> = list.items.iter().map(|ns| ns.name_any()).collect();
        names.sort();
        Ok(names)
    }

    async fn pod_controllers(&self, namespace: &str) -> Result<Vec<PodController>> {
        let mut res = Vec::new();

        let deploys: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = deploys
            .list(&ListParams::default())
            .await
            .with_context(|| format!("collecting deployments in {}", namespace))?;
        for d in list.items {
            if !resource_is_addon(&d) {
                res.push(PodController::Deployment(d));
            }
        }

        let rcs: Api<ReplicationController> = Api::namespaced(self.client.clone(), namespace);
        let list = rcs
            .list(&ListParams::default())
            .await
            .with_context(|| format!("collecting replication controllers in {}", namespace))?;
        for rc in list.items {
            if !resource_is_addon(&rc) {
                res.push(PodController::ReplicationController(rc));
            }
        }

        Ok(res)
    }

    fn make_service(
        &self,
        namespace: &str,
        service: &K8sService,
        controllers: &[PodController],
    ) -> Result<Service> {
        let id = ServiceId::new(namespace, &service.name_any())?;
        let spec = service.spec.as_ref();

        let mut metadata = BTreeMap::new();
        if let Some(ts) = service.meta().creation_timestamp.as_ref() {
            metadata.insert("created_at".to_string(), ts.0.to_rfc3339());
        }
        if let Some(rv) = service.meta().resource_version.as_ref() {
            metadata.insert("resource_version".to_string(), rv.clone());
        }
        if let Some(uid) = service.meta().uid.as_ref() {
            metadata.insert("uid".to_string(), uid.clone());
        }
        if let Some(t) = spec.and_then(|s| s.type_.as_ref()) {
            metadata.insert("type".to_string(), t.clone());
        }

        let selector = spec.and_then(|s| s.selector.clone()).unwrap_or_default();
        let (containers, status) = match match_controller(&selector, controllers) {
            Ok(pc) => (ContainersOrExcuse::Containers(pc.template_containers()), pc.status()),
            Err(excuse) => {
                (ContainersOrExcuse::Excuse(excuse.to_string()), STATUS_UNKNOWN.to_string())
            }
        };

        Ok(Service {
            id,
            ip: spec.and_then(|s| s.cluster_ip.clone()).unwrap_or_default(),
            status,
            metadata,
            containers,
        })
    }

    async fn services_in(&self, namespace: &str) -> Result<Vec<Service>> {
        let controllers = self.pod_controllers(namespace).await?;
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("getting services in {}", namespace))?;

        let mut res = Vec::new();
        for svc in &list.items {
            if resource_is_addon(svc) {
                continue;
            }
            res.push(self.make_service(namespace, svc, &controllers)?);
        }
        Ok(res)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn all_services(&self, namespace: Option<&str>) -> Result<Vec<Service>> {
        let t0 = std::time::Instant::now();
        let namespaces = match namespace {
            Some(ns) => vec![ns.to_string()],
            None => self.namespaces().await?,
        };
        let mut res = Vec::new();
        for ns in &namespaces {
            res.extend(self.services_in(ns).await?);
        }
        histogram!("cluster_list_services_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(count = res.len(), took_ms = %t0.elapsed().as_millis(), "cluster: all services");
        Ok(res)
    }

    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>> {
        // Group by namespace so controllers are fetched once per namespace.
        let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for id in ids {
            by_namespace.entry(id.namespace().to_string()).or_default().push(id.name().to_string());
        }

        let mut res = Vec::new();
        for (ns, names) in &by_namespace {
            let controllers = self.pod_controllers(ns).await?;
            let api: Api<K8sService> = Api::namespaced(self.client.clone(), ns);
            for name in names {
                let svc = match api.get_opt(name).await? {
                    Some(svc) => svc,
                    None => continue,
                };
                if resource_is_addon(&svc) {
                    continue;
                }
                res.push(self.make_service(ns, &svc, &controllers)?);
            }
        }
        Ok(res)
    }

    async fn ping(&self) -> Result<()> {
        self.client.apiserver_version().await.context("pinging API server")?;
        Ok(())
    }

    async fn export(&self) -> Result<Vec<u8>> {
        let t0 = std::time::Instant::now();
        let mut out = Vec::new();

        for ns in self.namespaces().await? {
            let ns_api: Api<Namespace> = Api::all(self.client.clone());
            let ns_obj = ns_api.get(&ns).await.context("getting namespace")?;
            append_yaml(&mut out, "v1", "Namespace", &ns_obj)?;

            let deploys: Api<Deployment> = Api::namespaced(self.client.clone(), &ns);
            let mut items = deploys.list(&ListParams::default()).await?.items;
            items.sort_by_key(|d| d.name_any());
            for d in items {
                if !resource_is_addon(&d) {
                    append_yaml(&mut out, "apps/v1", "Deployment", &d)?;
                }
            }

            let rcs: Api<ReplicationController> = Api::namespaced(self.client.clone(), &ns);
            let mut items = rcs.list(&ListParams::default()).await?.items;
            items.sort_by_key(|rc| rc.name_any());
            for rc in items {
                if !resource_is_addon(&rc) {
                    append_yaml(&mut out, "v1", "ReplicationController", &rc)?;
                }
            }

            let svcs: Api<K8sService> = Api::namespaced(self.client.clone(), &ns);
            let mut items = svcs.list(&ListParams::default()).await?.items;
            items.sort_by_key(|s| s.name_any());
            for s in items {
                if !resource_is_addon(&s) {
                    append_yaml(&mut out, "v1", "Service", &s)?;
                }
            }
        }

        histogram!("cluster_export_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(bytes = out.len(), took_ms = %t0.elapsed().as_millis(), "cluster: export done");
        Ok(out)
    }

    async fn sync(&self, def: SyncDef) -> Result<(), SyncError> {
        counter!("cluster_sync_total", 1u64);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.actions
            .send(SyncRequest { def, reply: reply_tx })
            .await
            .map_err(|_| SyncError::Aborted("sync queue is closed".to_string()))?;
        reply_rx.await.map_err(|_| SyncError::Aborted("sync loop went away".to_string()))?
    }

    fn find_defined_services(&self, root: &Path) -> Result<BTreeMap<ServiceId, Vec<PathBuf>>> {
        manifests::find_defined_services(root)
    }

    fn update_definition(&self, definition: &[u8], image: &ImageId) -> Result<Vec<u8>> {
        manifests::update_definition(definition, image)
    }
}

/// Serialise an object with an explicit header; the typed objects don't carry
/// their own apiVersion/kind.
fn append_yaml<T: serde::Serialize>(
    buffer: &mut Vec<u8>,
    api_version: &str,
    kind: &str,
    object: &T,
) -> Result<()> {
    let yaml = serde_yaml::to_string(object).context("marshalling object to YAML")?;
    buffer.extend_from_slice(b"---\n");
    buffer.extend_from_slice(format!("apiVersion: {}\nkind: {}\n", api_version, kind).as_bytes());
    buffer.extend_from_slice(yaml.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn addons_only_live_in_kube_system() {
        let l = labels(&[("kubernetes.io/cluster-service", "true")]);
        assert!(is_addon(Some("kube-system"), &l));
        assert!(!is_addon(Some("default"), &l));
        assert!(!is_addon(None, &l));
    }

    #[test]
    fn addon_labels() {
        for l in [
            labels(&[("kubernetes.io/cluster-service", "true")]),
            labels(&[("addonmanager.kubernetes.io/mode", "EnsureExists")]),
            labels(&[("addonmanager.kubernetes.io/mode", "Reconcile")]),
        ] {
            assert!(is_addon(Some("kube-system"), &l));
        }
        assert!(!is_addon(Some("kube-system"), &labels(&[("app", "dns")])));
        assert!(!is_addon(Some("kube-system"), &labels(&[("kubernetes.io/cluster-service", "false")])));
    }

    #[test]
    fn resource_addon_check_reads_metadata() {
        let mut d = Deployment::default();
        d.metadata = ObjectMeta {
            name: Some("kube-dns".into()),
            namespace: Some("kube-system".into()),
            labels: Some(labels(&[("addonmanager.kubernetes.io/mode", "Reconcile")])),
            ..Default::default()
        };
        assert!(resource_is_addon(&d));
    }

    #[test]
    fn append_yaml_writes_separator_and_header() {
        let mut buf = Vec::new();
        let ns = Namespace {
            metadata: ObjectMeta { name: Some("default".into()), ..Default::default() },
            ..Default::default()
        };
        append_yaml(&mut buf, "v1", "Namespace", &ns).unwrap();
        let s = String::from_utf8(buf).unwrap();
        assert!(s.starts_with("---\napiVersion: v1\nkind: Namespace\n"), "got: {}", s);
        assert!(s.contains("name: default"));
    }
}
