//! Job runner and instancer behaviour: claiming, queue partitioning, GC
//! reclaim, shutdown, and release jobs driven over the standalone bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use drover_bus::{MessageBus, StandaloneBus};
use drover_core::{
    ImageSelector, ImageStatus, Platform, PlatformResult, ReleaseKind, ReleaseResult, ReleaseSpec,
    ReleaseStatus, ServiceResult, ServiceSelector, ServiceSpec, ServiceStatus,
};
use drover_hub::handlers::{AutomatedInstanceHandler, ReleaseHandler};
use drover_hub::history::{HistoryStore, SqliteHistory};
use drover_hub::instance::{InstanceConfig, InstanceError, Instancer, MemConfigStore, MultitenantInstancer};
use drover_hub::jobs::{
    Job, JobHandler, JobStatus, JobStore, MemJobStore, Worker, AUTOMATED_INSTANCE_JOB, RELEASE_JOB,
};

fn release_spec() -> ReleaseSpec {
    ReleaseSpec {
        services: ServiceSelector::All,
        image: ImageSelector::LatestForAll,
        kind: ReleaseKind::Execute,
        excludes: vec![],
    }
}

struct RecordingHandler {
    seen: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &mut Job) -> Result<()> {
        self.seen.lock().unwrap().push(job.id.clone());
        if self.fail {
            anyhow::bail!("handler exploded");
        }
        Ok(())
    }
}

async fn run_worker_briefly(worker: Worker) {
    let shutdown = worker.shutdown_handle();
    let task = tokio::spawn(async move { worker.run().await });
    tokio::time::sleep(Duration::from_millis(1200)).await;
    shutdown.notify_one();
    task.await.unwrap();
}

#[tokio::test]
async fn a_worker_claims_and_completes_jobs() {
    let store = Arc::new(MemJobStore::default());
    let id = store
        .enqueue(Job::release("tenant-1".to_string(), release_spec()))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(vec![]));
    let mut worker = Worker::new(store.clone(), vec![RELEASE_JOB.to_string()]);
    worker.register(RELEASE_JOB, Arc::new(RecordingHandler { seen: seen.clone(), fail: false }));
    run_worker_briefly(worker).await;

    assert_eq!(seen.lock().unwrap().as_slice(), &[id.clone()]);
    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn a_failing_handler_fails_the_job() {
    let store = Arc::new(MemJobStore::default());
    let id = store
        .enqueue(Job::release("tenant-1".to_string(), release_spec()))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(vec![]));
    let mut worker = Worker::new(store.clone(), vec![RELEASE_JOB.to_string()]);
    worker.register(RELEASE_JOB, Arc::new(RecordingHandler { seen, fail: true }));
    run_worker_briefly(worker).await;

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("handler exploded"));
}

#[tokio::test]
async fn workers_only_drain_their_own_queues() {
    let store = Arc::new(MemJobStore::default());
    let release_id =
        store.enqueue(Job::release("tenant-1".to_string(), release_spec())).await.unwrap();
    store.enqueue(Job::automated_instance("tenant-1".to_string())).await.unwrap();

    // This worker serves only the automated-instance queue.
    let seen = Arc::new(Mutex::new(vec![]));
    let mut worker = Worker::new(store.clone(), vec![AUTOMATED_INSTANCE_JOB.to_string()]);
    worker.register(
        AUTOMATED_INSTANCE_JOB,
        Arc::new(RecordingHandler { seen: seen.clone(), fail: false }),
    );
    run_worker_briefly(worker).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    let release_job = store.get(&release_id).await.unwrap().unwrap();
    assert_eq!(release_job.status, JobStatus::Queued, "the release job must stay put");
}

#[tokio::test]
async fn gc_returns_stale_jobs_to_their_queue() {
    // Zero visibility: anything running is immediately reclaimable.
    let store = MemJobStore::new(Duration::from_secs(0));
    let id = store.enqueue(Job::release("tenant-1".to_string(), release_spec())).await.unwrap();

    let claimed = store.claim(&[RELEASE_JOB.to_string()]).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert!(store.claim(&[RELEASE_JOB.to_string()]).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.gc().await.unwrap(), 1);
    let reclaimed = store.claim(&[RELEASE_JOB.to_string()]).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
}

struct StubPlatform {
    result: ReleaseResult,
}

#[async_trait]
impl Platform for StubPlatform {
    async fn ping(&self) -> PlatformResult<()> {
        Ok(())
    }
    async fn version(&self) -> PlatformResult<String> {
        Ok("stub".into())
    }
    async fn export(&self) -> PlatformResult<Vec<u8>> {
        Ok(vec![])
    }
    async fn list_services(&self, _ns: Option<String>) -> PlatformResult<Vec<ServiceStatus>> {
        Ok(vec![])
    }
    async fn list_images(&self, _services: ServiceSpec) -> PlatformResult<Vec<ImageStatus>> {
        Ok(vec![])
    }
    async fn update_images(&self, _spec: ReleaseSpec) -> PlatformResult<ReleaseResult> {
        Ok(self.result.clone())
    }
    async fn sync_cluster(&self) -> PlatformResult<()> {
        Ok(())
    }
    async fn sync_status(&self, _reference: String) -> PlatformResult<Vec<String>> {
        Ok(vec![])
    }
}

fn temp_history() -> Arc<SqliteHistory> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db").to_string_lossy().to_string();
    std::mem::forget(dir);
    Arc::new(SqliteHistory::open(&path).unwrap())
}

fn instancer_over(
    bus: Arc<dyn MessageBus>,
    history: Arc<SqliteHistory>,
    instance: &str,
) -> Arc<MultitenantInstancer> {
    let configs = Arc::new(MemConfigStore::new());
    configs.insert(instance.to_string(), InstanceConfig::default());
    let mut instancer = MultitenantInstancer::new(bus, configs, history);
    instancer.presence_grace = Duration::from_millis(200);
    Arc::new(instancer)
}

#[tokio::test]
async fn instancer_reports_missing_config() {
    let bus = Arc::new(StandaloneBus::new());
    let instancer = MultitenantInstancer::new(bus, Arc::new(MemConfigStore::new()), temp_history());
    match instancer.get(&"unknown".to_string()).await {
        Err(InstanceError::ConfigNotFound(inst)) => assert_eq!(inst, "unknown"),
        other => panic!("expected config-not-found, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn instancer_reports_absent_daemons() {
    let bus: Arc<dyn MessageBus> = Arc::new(StandaloneBus::new());
    let history = temp_history();
    let instancer = instancer_over(bus, history, "tenant-1");
    match instancer.get(&"tenant-1".to_string()).await {
        Err(InstanceError::PlatformUnavailable(inst, _)) => assert_eq!(inst, "tenant-1"),
        other => panic!("expected platform-unavailable, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn a_release_job_lands_on_the_daemon_and_in_history() {
    let bus: Arc<dyn MessageBus> = Arc::new(StandaloneBus::new());
    let history = temp_history();
    let instance = "tenant-1".to_string();

    let mut result = ReleaseResult::new();
    result.insert(
        "a/y".parse().unwrap(),
        ServiceResult { status: ReleaseStatus::Success, error: String::new(), updates: vec![] },
    );
    let (done, _done_rx) = mpsc::channel(1);
    bus.subscribe(&instance, Arc::new(StubPlatform { result }), done).await;

    let instancer = instancer_over(bus, history.clone(), &instance);
    let store = Arc::new(MemJobStore::default());
    let id = store.enqueue(Job::release(instance.clone(), release_spec())).await.unwrap();

    let mut worker = Worker::new(store.clone(), vec![RELEASE_JOB.to_string()]);
    worker.register(RELEASE_JOB, Arc::new(ReleaseHandler { instancer }));
    run_worker_briefly(worker).await;

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let result = job.result.expect("per-service result recorded on the job");
    assert_eq!(result.get(&"a/y".parse().unwrap()).unwrap().status, ReleaseStatus::Success);

    let events = history.events_for(&instance, None).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].service_ids[0].to_string(), "a/y");
}

#[tokio::test]
async fn automated_instances_fan_out_into_release_jobs() {
    let configs = Arc::new(MemConfigStore::new());
    let mut automated = drover_core::ServiceIdSet::new();
    automated.add(["a/x".parse().unwrap()]);
    configs.insert("tenant-1".to_string(), InstanceConfig { automated });

    let store = Arc::new(MemJobStore::default());
    store.enqueue(Job::automated_instance("tenant-1".to_string())).await.unwrap();

    let mut worker = Worker::new(store.clone(), vec![AUTOMATED_INSTANCE_JOB.to_string()]);
    worker.register(
        AUTOMATED_INSTANCE_JOB,
        Arc::new(AutomatedInstanceHandler { configs, store: store.clone() }),
    );
    run_worker_briefly(worker).await;

    let spawned = store.claim(&[RELEASE_JOB.to_string()]).await.unwrap();
    let spawned = spawned.expect("a release job was enqueued");
    assert_eq!(spawned.instance, "tenant-1");
    match spawned.params {
        drover_hub::jobs::JobParams::Release(spec) => match spec.services {
            ServiceSelector::Specific(ids) => assert_eq!(ids[0].to_string(), "a/x"),
            other => panic!("expected specific services, got {:?}", other),
        },
        other => panic!("expected release params, got {:?}", other),
    }
}
