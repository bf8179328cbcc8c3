//! The job runner: queue-per-type stores and workers, so a slow release can
//! never starve another job class.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use drover_core::{InstanceId, ReleaseResult, ReleaseSpec};

pub const DEFAULT_QUEUE: &str = "default";
pub const RELEASE_JOB: &str = "release";
pub const AUTOMATED_INSTANCE_JOB: &str = "automated-instance";

/// How often a worker polls its queues for work.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often an in-flight job's claim is refreshed.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub type JobId = String;

pub fn new_job_id() -> JobId {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobParams {
    Release(ReleaseSpec),
    AutomatedInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub id: JobId,
    pub instance: InstanceId,
    pub queue: String,
    pub params: JobParams,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReleaseResult>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn release(instance: InstanceId, spec: ReleaseSpec) -> Self {
        Job::new(instance, RELEASE_JOB.to_string(), JobParams::Release(spec))
    }

    pub fn automated_instance(instance: InstanceId) -> Self {
        Job::new(instance, AUTOMATED_INSTANCE_JOB.to_string(), JobParams::AutomatedInstance)
    }

    fn new(instance: InstanceId, queue: String, params: JobParams) -> Self {
        Job {
            id: new_job_id(),
            instance,
            queue,
            params,
            status: JobStatus::Queued,
            error: None,
            result: None,
            submitted_at: Utc::now(),
            claimed_at: None,
            heartbeat_at: None,
            finished_at: None,
        }
    }

    /// The handler key for this job.
    pub fn method(&self) -> &'static str {
        match self.params {
            JobParams::Release(_) => RELEASE_JOB,
            JobParams::AutomatedInstance => AUTOMATED_INSTANCE_JOB,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<JobId>;
    /// Atomically claim the next job from the given queues, if any.
    async fn claim(&self, queues: &[String]) -> Result<Option<Job>>;
    async fn heartbeat(&self, id: &JobId) -> Result<()>;
    /// Record a job's terminal state.
    async fn complete(&self, job: Job) -> Result<()>;
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;
    /// Return jobs whose claim went stale to their queues; the count is how
    /// many were rescued.
    async fn gc(&self) -> Result<usize>;
}

/// In-memory job store with a visibility timeout; the durable store lives
/// behind the trait.
pub struct MemJobStore {
    inner: Mutex<MemJobs>,
    visibility: chrono::Duration,
}

#[derive(Default)]
struct MemJobs {
    queues: HashMap<String, VecDeque<JobId>>,
    jobs: HashMap<JobId, Job>,
}

impl MemJobStore {
    pub fn new(visibility: Duration) -> Self {
        MemJobStore {
            inner: Mutex::new(MemJobs::default()),
            visibility: chrono::Duration::from_std(visibility)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }
}

impl Default for MemJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl JobStore for MemJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut inner = self.inner.lock().unwrap();
        let id = job.id.clone();
        inner.queues.entry(job.queue.clone()).or_default().push_back(id.clone());
        inner.jobs.insert(id.clone(), job);
        counter!("jobs_enqueued_total", 1u64);
        Ok(id)
    }

    async fn claim(&self, queues: &[String]) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().unwrap();
        for queue in queues {
            let id = match inner.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                Some(id) => id,
                None => continue,
            };
            if let Some(job) = inner.jobs.get_mut(&id) {
                let now = Utc::now();
                job.status = JobStatus::Running;
                job.claimed_at = Some(now);
                job.heartbeat_at = Some(now);
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn heartbeat(&self, id: &JobId) -> Result<()> {
        if let Some(job) = self.inner.lock().unwrap().jobs.get_mut(id) {
            job.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn complete(&self, job: Job) -> Result<()> {
        self.inner.lock().unwrap().jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(id).cloned())
    }

    async fn gc(&self) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - self.visibility;
        let stale: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.heartbeat_at.map_or(true, |h| h < cutoff))
            .map(|j| j.id.clone())
            .collect();
        for id in &stale {
            let queue = match inner.jobs.get_mut(id) {
                Some(job) => {
                    job.status = JobStatus::Queued;
                    job.claimed_at = None;
                    job.heartbeat_at = None;
                    job.queue.clone()
                }
                None => continue,
            };
            inner.queues.entry(queue).or_default().push_back(id.clone());
        }
        Ok(stale.len())
    }
}

/// What a job does when it runs. Handlers fill in `job.result`; returning an
/// error fails the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &mut Job) -> Result<()>;
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    queues: Vec<String>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    shutdown: Arc<Notify>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, queues: Vec<String>) -> Self {
        Worker {
            store,
            queues,
            handlers: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn register(&mut self, method: &'static str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(method, handler);
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Poll the queues and run jobs until told to stop. The caller bounds the
    /// wait after signalling shutdown; anything abandoned mid-flight is the
    /// store's reclaim to make.
    pub async fn run(&self) {
        info!(queues = ?self.queues, "worker started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                _ = tokio::time::sleep(self.poll_interval) => {
                    loop {
                        match self.store.claim(&self.queues).await {
                            Ok(Some(job)) => self.work_one(job).await,
                            Ok(None) => break,
                            Err(err) => {
                                error!(error = %format!("{:#}", err), "claiming next job failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(queues = ?self.queues, "worker stopped");
    }

    async fn work_one(&self, mut job: Job) {
        counter!("jobs_claimed_total", 1u64);
        let t0 = Instant::now();
        let id = job.id.clone();

        let handler = match self.handlers.get(job.method()) {
            Some(handler) => handler.clone(),
            None => {
                job.status = JobStatus::Failed;
                job.error = Some(format!("no handler registered for {}", job.method()));
                job.finished_at = Some(Utc::now());
                let _ = self.store.complete(job).await;
                return;
            }
        };

        let store = self.store.clone();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let result = {
            let work = handler.handle(&mut job);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    res = &mut work => break res,
                    _ = heartbeat.tick() => {
                        let _ = store.heartbeat(&id).await;
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                job.status = JobStatus::Succeeded;
                counter!("jobs_succeeded_total", 1u64);
            }
            Err(err) => {
                warn!(job = %id, error = %format!("{:#}", err), "job failed");
                job.status = JobStatus::Failed;
                job.error = Some(format!("{:#}", err));
                counter!("jobs_failed_total", 1u64);
            }
        }
        job.finished_at = Some(Utc::now());
        histogram!("job_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(err) = self.store.complete(job).await {
            error!(job = %id, error = %format!("{:#}", err), "recording job outcome failed");
        }
    }
}

/// Ticker-driven sweep returning abandoned jobs to their queues.
pub struct Cleaner {
    store: Arc<dyn JobStore>,
}

impl Cleaner {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Cleaner { store }
    }

    pub async fn run(&self, interval: Duration, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,

                _ = tokio::time::sleep(interval) => {
                    match self.store.gc().await {
                        Ok(0) => {}
                        Ok(n) => info!(requeued = n, "returned abandoned jobs to their queues"),
                        Err(err) => error!(error = %format!("{:#}", err), "job GC failed"),
                    }
                }
            }
        }
    }
}
