//! Shared fixtures: a mock cluster over canned services, and a local bare
//! git repository seeded with manifest files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use git2::{Repository, Signature};

use drover_core::{
    Cluster, Container, ContainersOrExcuse, ImageId, Service, ServiceId, SyncDef, SyncError,
    STATUS_READY,
};

pub struct MockCluster {
    pub services: Mutex<Vec<Service>>,
    pub synced: Mutex<Vec<SyncDef>>,
    /// resource_id to error message, injected into sync replies.
    pub sync_errors: BTreeMap<String, String>,
}

impl MockCluster {
    pub fn new(services: Vec<Service>) -> Arc<Self> {
        Arc::new(MockCluster {
            services: Mutex::new(services),
            synced: Mutex::new(vec![]),
            sync_errors: BTreeMap::new(),
        })
    }

    pub fn with_sync_errors(
        services: Vec<Service>,
        sync_errors: BTreeMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(MockCluster { services: Mutex::new(services), synced: Mutex::new(vec![]), sync_errors })
    }

    pub fn sync_batches(&self) -> Vec<SyncDef> {
        self.synced.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn all_services(&self, namespace: Option<&str>) -> Result<Vec<Service>> {
        let services = self.services.lock().unwrap();
        Ok(services
            .iter()
            .filter(|s| namespace.map_or(true, |ns| s.id.namespace() == ns))
            .cloned()
            .collect())
    }

    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>> {
        let services = self.services.lock().unwrap();
        Ok(services.iter().filter(|s| ids.contains(&s.id)).cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn export(&self) -> Result<Vec<u8>> {
        Ok(vec![])
    }

    async fn sync(&self, def: SyncDef) -> Result<(), SyncError> {
        let mut errs = BTreeMap::new();
        for action in &def.actions {
            if let Some(msg) = self.sync_errors.get(&action.resource_id) {
                errs.insert(action.resource_id.clone(), msg.clone());
            }
        }
        self.synced.lock().unwrap().push(def);
        if errs.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Resources(errs))
        }
    }

    fn find_defined_services(&self, root: &Path) -> Result<BTreeMap<ServiceId, Vec<PathBuf>>> {
        drover_cluster::find_defined_services(root)
    }

    fn update_definition(&self, definition: &[u8], image: &ImageId) -> Result<Vec<u8>> {
        drover_cluster::update_definition(definition, image)
    }
}

pub fn running_service(id: &str, image: &str) -> Service {
    Service {
        id: id.parse().unwrap(),
        ip: "10.0.0.1".into(),
        status: STATUS_READY.into(),
        metadata: BTreeMap::new(),
        containers: ContainersOrExcuse::Containers(vec![Container {
            name: "main".into(),
            image: image.into(),
        }]),
    }
}

pub fn deployment_manifest(namespace: &str, name: &str, image: &str, locked: bool) -> String {
    let annotations = if locked {
        "\n  annotations:\n    drover.dev/locked: \"true\""
    } else {
        ""
    };
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: {namespace}{annotations}
spec:
  replicas: 1
  template:
    metadata:
      labels:
        name: {name}
    spec:
      containers:
      - name: main
        image: {image}
"#
    )
}

/// Seed a bare repository with the given files on master; returns a URL
/// suitable for cloning.
pub fn init_origin(dir: &Path, files: &[(&str, &str)]) -> String {
    let with_modes: Vec<(&str, &str, i32)> =
        files.iter().map(|(name, contents)| (*name, *contents, 0o100644)).collect();
    init_origin_with_modes(dir, &with_modes)
}

pub fn init_origin_with_modes(dir: &Path, files: &[(&str, &str, i32)]) -> String {
    let repo = Repository::init_bare(dir).unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    for (name, contents, mode) in files {
        let oid = repo.blob(contents.as_bytes()).unwrap();
        builder.insert(name, oid, *mode).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = Signature::now("seed", "seed@example.com").unwrap();
    repo.commit(Some("refs/heads/master"), &sig, &sig, "seed", &tree, &[]).unwrap();
    repo.set_head("refs/heads/master").unwrap();
    dir.to_str().unwrap().to_string()
}

/// Recorded file mode of an entry at the origin's HEAD.
pub fn origin_filemode(dir: &Path, name: &str) -> i32 {
    let repo = Repository::open_bare(dir).unwrap();
    let tree = repo.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
    let mode = tree.get_name(name).unwrap().filemode();
    mode
}

/// Number of commits on the origin's master branch.
pub fn origin_commit_count(dir: &Path) -> usize {
    let repo = Repository::open_bare(dir).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_head().unwrap();
    walk.count()
}

/// Contents of a file at the origin's HEAD.
pub fn origin_file(dir: &Path, name: &str) -> String {
    let repo = Repository::open_bare(dir).unwrap();
    let tree = repo.head().unwrap().peel_to_commit().unwrap().tree().unwrap();
    let entry = tree.get_name(name).unwrap();
    let blob = repo.find_blob(entry.id()).unwrap();
    String::from_utf8(blob.content().to_vec()).unwrap()
}
