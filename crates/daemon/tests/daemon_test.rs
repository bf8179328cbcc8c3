//! Daemon facade behaviour: the event-recording contract around releases,
//! sync status, and the HTTP surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use git2::{Repository, Signature};
use tower::ServiceExt;

use drover_core::{
    Cluster, Container, ContainersOrExcuse, Event, EventWriter, ImageId, ImageSelector,
    MemRegistry, Platform, ReleaseKind, ReleaseSpec, ReleaseStatus, Service, ServiceId,
    ServiceSelector, SyncDef, SyncError, STATUS_READY,
};
use drover_daemon::{http, Daemon};
use drover_workspace::Repo;

struct MockCluster {
    services: Vec<Service>,
    synced: Mutex<Vec<SyncDef>>,
}

impl MockCluster {
    fn new(services: Vec<Service>) -> Arc<Self> {
        Arc::new(MockCluster { services, synced: Mutex::new(vec![]) })
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn all_services(&self, namespace: Option<&str>) -> Result<Vec<Service>> {
        Ok(self
            .services
            .iter()
            .filter(|s| namespace.map_or(true, |ns| s.id.namespace() == ns))
            .cloned()
            .collect())
    }

    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>> {
        Ok(self.services.iter().filter(|s| ids.contains(&s.id)).cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn export(&self) -> Result<Vec<u8>> {
        Ok(b"---\n".to_vec())
    }

    async fn sync(&self, def: SyncDef) -> Result<(), SyncError> {
        self.synced.lock().unwrap().push(def);
        Ok(())
    }

    fn find_defined_services(&self, root: &Path) -> Result<BTreeMap<ServiceId, Vec<PathBuf>>> {
        drover_cluster::find_defined_services(root)
    }

    fn update_definition(&self, definition: &[u8], image: &ImageId) -> Result<Vec<u8>> {
        drover_cluster::update_definition(definition, image)
    }
}

#[derive(Default)]
struct CapturingEventWriter {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventWriter for CapturingEventWriter {
    async fn log_event(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct FailingEventWriter;

#[async_trait]
impl EventWriter for FailingEventWriter {
    async fn log_event(&self, _event: Event) -> Result<()> {
        Err(anyhow!("event store is down"))
    }
}

fn running_service(id: &str, image: &str) -> Service {
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

fn manifest(name: &str, image: &str) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: a
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

fn init_origin(dir: &Path, files: &[(&str, &str)]) -> String {
    let repo = Repository::init_bare(dir).unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    for (name, contents) in files {
        let oid = repo.blob(contents.as_bytes()).unwrap();
        builder.insert(name, oid, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = Signature::now("seed", "seed@example.com").unwrap();
    repo.commit(Some("refs/heads/master"), &sig, &sig, "seed", &tree, &[]).unwrap();
    repo.set_head("refs/heads/master").unwrap();
    dir.to_str().unwrap().to_string()
}

fn daemon_over(url: String, events: Arc<dyn EventWriter>) -> Daemon {
    let cluster = MockCluster::new(vec![running_service("a/y", "r/i:1")]);
    Daemon::new(
        "0.1.0-test".into(),
        cluster,
        Arc::new(MemRegistry::new()),
        Repo { url, branch: "master".into(), path: String::new(), key_path: None },
        events,
    )
}

fn release_spec() -> ReleaseSpec {
    ReleaseSpec {
        services: ServiceSelector::Specific(vec!["a/y".parse().unwrap()]),
        image: ImageSelector::Specific("r/i:2".parse().unwrap()),
        kind: ReleaseKind::Execute,
        excludes: vec![],
    }
}

#[tokio::test]
async fn update_images_records_a_release_event() {
    let origin = tempfile::tempdir().unwrap();
    let url = init_origin(origin.path(), &[("y.yaml", &manifest("y", "r/i:1"))]);
    let events = Arc::new(CapturingEventWriter::default());
    let daemon = daemon_over(url, events.clone());

    let results = daemon.update_images(release_spec()).await.unwrap();
    assert_eq!(results.get(&"a/y".parse().unwrap()).unwrap().status, ReleaseStatus::Success);

    let recorded = events.events.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    let meta = recorded[0].metadata.as_ref().unwrap();
    assert!(meta.error.is_empty());
    assert_eq!(recorded[0].service_ids, vec!["a/y".parse::<ServiceId>().unwrap()]);
    assert!(recorded[0].ended_at >= recorded[0].started_at);
}

#[tokio::test]
async fn a_logging_failure_never_masks_a_successful_release() {
    let origin = tempfile::tempdir().unwrap();
    let url = init_origin(origin.path(), &[("y.yaml", &manifest("y", "r/i:1"))]);
    let daemon = daemon_over(url, Arc::new(FailingEventWriter));

    let results = daemon.update_images(release_spec()).await.unwrap();
    assert_eq!(results.get(&"a/y".parse().unwrap()).unwrap().status, ReleaseStatus::Success);
}

#[tokio::test]
async fn a_failed_release_returns_its_own_error() {
    // Point at a repo that cannot be cloned; the release fails outright and
    // that error must survive the (also failing) event write.
    let daemon = daemon_over("/nonexistent/manifests.git".into(), Arc::new(FailingEventWriter));
    let err = daemon.update_images(release_spec()).await.unwrap_err();
    assert!(err.to_string().contains("cloning"), "got: {}", err);
}

#[tokio::test]
async fn sync_status_is_answered_relative_to_the_applied_head() {
    let origin = tempfile::tempdir().unwrap();
    let url = init_origin(origin.path(), &[("y.yaml", &manifest("y", "r/i:1"))]);
    let events = Arc::new(CapturingEventWriter::default());
    let daemon = daemon_over(url, events);

    // Nothing applied yet: the whole history is pending.
    let pending = daemon.sync_status("HEAD".into()).await.unwrap();
    assert_eq!(pending.len(), 1);

    // A release applies and records the new head; nothing is pending then.
    daemon.update_images(release_spec()).await.unwrap();
    let pending = daemon.sync_status("HEAD".into()).await.unwrap();
    assert!(pending.is_empty(), "expected no pending commits, got {:?}", pending);
}

#[tokio::test]
async fn version_reports_the_build() {
    let origin = tempfile::tempdir().unwrap();
    let url = init_origin(origin.path(), &[("y.yaml", &manifest("y", "r/i:1"))]);
    let daemon = daemon_over(url, Arc::new(CapturingEventWriter::default()));
    assert_eq!(daemon.version().await.unwrap(), "0.1.0-test");
}

#[tokio::test]
async fn http_unknown_routes_get_a_structured_404() {
    let origin = tempfile::tempdir().unwrap();
    let url = init_origin(origin.path(), &[("y.yaml", &manifest("y", "r/i:1"))]);
    let daemon = Arc::new(daemon_over(url, Arc::new(CapturingEventWriter::default())));
    let app = http::router(daemon);

    let response = app
        .oneshot(Request::builder().uri("/v1/nonsense").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["path"], "/v1/nonsense");
}

#[tokio::test]
async fn http_sync_accepts_and_reports() {
    let origin = tempfile::tempdir().unwrap();
    let url = init_origin(origin.path(), &[("y.yaml", &manifest("y", "r/i:1"))]);
    let daemon = Arc::new(daemon_over(url, Arc::new(CapturingEventWriter::default())));
    let app = http::router(daemon);

    let response = app
        .clone()
        .oneshot(Request::builder().method("POST").uri("/v1/sync").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .oneshot(Request::builder().uri("/v1/sync?ref=HEAD").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let commits: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert!(commits.len() <= 2);
}
