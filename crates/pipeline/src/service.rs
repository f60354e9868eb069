//! Encoding service: job queue, registry and event fan-out.
//!
//! Jobs are admitted through three gates in order: a job slot from the
//! job-level semaphore, the pause switch, and a per-minute admission quota.
//! Every job pushes its events into one `mpsc` channel; a forwarder task
//! drops finished jobs from the registry and re-broadcasts each event.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::Config;
use crate::events::JobEvent;
use crate::job::{EncodingJob, JobOptions, JobSettings, JobStatus};
use crate::startup::{run_startup_checks, InitializationError};
use crate::supervisor::ProcessSupervisor;
use crate::validation::{validator_for, InputValidator, ValidationError};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use serde::Serialize;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered events per broadcast subscriber
const EVENT_BUFFER: usize = 1024;

type AdmissionLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Initialization failed: {0}")]
    Initialization(#[from] InitializationError),

    #[error("Input rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} already finished")]
    JobFinished(String),

    #[error("Service is shutting down")]
    ShuttingDown,
}

/// Returned by [`EncodingService::queue_video`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
}

/// One row of [`ServiceStatus`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub input: PathBuf,
    pub status: JobStatus,
    /// Global progress in percent
    pub progress: f64,
    pub stage: Option<String>,
}

/// Queue-level status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub pending: usize,
    pub active: usize,
    pub paused: bool,
    pub jobs: Vec<JobSummary>,
}

/// Outcome of [`EncodingService::cleanup`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cancelled: usize,
    pub killed: usize,
    pub residual: usize,
    pub temp_dirs_removed: usize,
}

/// Façade over the job queue
pub struct EncodingService {
    settings: Arc<JobSettings>,
    plan: ConcurrencyPlan,
    supervisor: Arc<ProcessSupervisor>,
    validator: Arc<dyn InputValidator>,
    /// Live jobs in submission order
    jobs: RwLock<Vec<Arc<EncodingJob>>>,
    job_slots: Arc<Semaphore>,
    paused: watch::Sender<bool>,
    limiter: AdmissionLimiter,
    job_events: mpsc::UnboundedSender<JobEvent>,
    events: broadcast::Sender<JobEvent>,
    shutting_down: AtomicBool,
}

impl EncodingService {
    /// Run startup checks and build the service
    ///
    /// Must be called inside a tokio runtime; the event forwarder is spawned
    /// here.
    pub async fn new(config: Config) -> Result<Arc<Self>, ServiceError> {
        let checked = config.clone();
        tokio::task::spawn_blocking(move || run_startup_checks(&checked))
            .await
            .map_err(|e| InitializationError::Io(std::io::Error::other(e)))??;
        Ok(Self::new_without_checks(config).await)
    }

    /// Build the service without probing the external binaries
    pub async fn new_without_checks(config: Config) -> Arc<Self> {
        let plan = derive_plan(&config);
        Self::with_supervisor(
            config.clone(),
            Arc::new(ProcessSupervisor::from_config(&config.supervisor)),
            plan,
        )
    }

    /// Build around an existing supervisor
    pub fn with_supervisor(
        config: Config,
        supervisor: Arc<ProcessSupervisor>,
        plan: ConcurrencyPlan,
    ) -> Arc<Self> {
        let settings = Arc::new(JobSettings::from_config(&config, &plan));
        let quota = Quota::per_minute(
            NonZeroU32::new(plan.admissions_per_minute).unwrap_or(NonZeroU32::MIN),
        );
        let (job_events, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (paused, _) = watch::channel(false);

        info!(
            cores = plan.total_cores,
            max_parallel_jobs = plan.max_parallel_jobs,
            renditions_per_job = plan.renditions_per_job,
            admissions_per_minute = plan.admissions_per_minute,
            "Encoding service ready"
        );

        let service = Arc::new(Self {
            settings,
            supervisor,
            validator: validator_for(&config.validation),
            jobs: RwLock::new(Vec::new()),
            job_slots: Arc::new(Semaphore::new(plan.max_parallel_jobs.max(1) as usize)),
            paused,
            limiter: RateLimiter::direct(quota),
            job_events,
            events,
            shutting_down: AtomicBool::new(false),
            plan,
        });
        tokio::spawn(forward_events(Arc::downgrade(&service), rx));
        service
    }

    pub fn plan(&self) -> &ConcurrencyPlan {
        &self.plan
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Receive every job event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn job(&self, id: &str) -> Option<Arc<EncodingJob>> {
        self.jobs.read().iter().find(|j| j.id() == id).cloned()
    }

    /// Validate an input, create its job and put it on the queue
    pub fn queue_video(
        self: &Arc<Self>,
        input: impl AsRef<Path>,
        options: JobOptions,
    ) -> Result<JobHandle, ServiceError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::ShuttingDown);
        }
        let input = input.as_ref();
        self.validator.validate(input)?;

        let id = Uuid::new_v4().to_string();
        let job = EncodingJob::new(
            id.clone(),
            input,
            Arc::clone(&self.settings),
            options,
            Arc::clone(&self.supervisor),
            self.job_events.clone(),
        );
        self.jobs.write().push(Arc::clone(&job));
        info!(
            job_id = %id,
            input = %input.display(),
            validator = self.validator.name(),
            "Job queued"
        );

        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_job(job).await });
        Ok(JobHandle { id })
    }

    async fn run_job(self: Arc<Self>, job: Arc<EncodingJob>) {
        let _slot = match Arc::clone(&self.job_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!(job_id = %job.id(), "Queue closed before job started");
                return;
            }
        };

        let mut paused = self.paused.subscribe();
        if paused.wait_for(|p| !*p).await.is_err() {
            return;
        }
        if job.status() != JobStatus::Pending {
            return;
        }
        self.limiter.until_ready().await;

        let id = job.id().to_string();
        let status = job.encode().await;
        debug!(job_id = %id, status = %status, "Job task finished");
    }

    /// Cancel one job. The handle resolves once its processes and
    /// directories are gone.
    pub fn cancel_job(&self, id: &str) -> Result<JoinHandle<()>, ServiceError> {
        let job = self
            .job(id)
            .ok_or_else(|| ServiceError::JobNotFound(id.to_string()))?;
        job.cancel()
            .ok_or_else(|| ServiceError::JobFinished(id.to_string()))
    }

    pub fn status(&self) -> ServiceStatus {
        let jobs: Vec<JobSummary> = self
            .jobs
            .read()
            .iter()
            .map(|job| {
                let snapshot = job.progress();
                JobSummary {
                    id: job.id().to_string(),
                    input: job.input().to_path_buf(),
                    status: job.status(),
                    progress: snapshot.percent(),
                    stage: snapshot.active_stage,
                }
            })
            .collect();

        ServiceStatus {
            pending: jobs.iter().filter(|j| j.status == JobStatus::Pending).count(),
            active: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Processing)
                .count(),
            paused: *self.paused.borrow(),
            jobs,
        }
    }

    /// Stop starting new jobs; running jobs continue
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Cancel every job, kill every supervised process and clear leftover
    /// job directories under the temp root
    pub async fn cleanup(&self) -> CleanupReport {
        let jobs: Vec<Arc<EncodingJob>> = self.jobs.read().clone();
        let mut report = CleanupReport::default();

        let handles: Vec<JoinHandle<()>> = jobs.iter().filter_map(|job| job.cancel()).collect();
        report.cancelled = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job cleanup task failed");
            }
        }

        for kill in self.supervisor.kill_all().await {
            report.killed += kill.killed;
            report.residual += kill.residual;
        }

        report.temp_dirs_removed = remove_stale_job_dirs(&self.settings.temp_root).await;
        info!(
            cancelled = report.cancelled,
            killed = report.killed,
            residual = report.residual,
            temp_dirs_removed = report.temp_dirs_removed,
            "Cleanup complete"
        );
        report
    }

    /// Reject further submissions, close the queue and run [`cleanup`](Self::cleanup)
    pub async fn destroy(&self) -> CleanupReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.job_slots.close();
        self.cleanup().await
    }

    fn remove_job(&self, id: &str) {
        self.jobs.write().retain(|j| j.id() != id);
    }
}

impl std::fmt::Debug for EncodingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodingService")
            .field("plan", &self.plan)
            .field("jobs", &self.jobs.read().len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

async fn forward_events(service: Weak<EncodingService>, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        if event.kind.is_terminal() {
            service.remove_job(&event.job_id);
        }
        // no subscribers is fine
        let _ = service.events.send(event);
    }
}

/// Remove directories named like job ids; anything else is left alone
async fn remove_stale_job_dirs(temp_root: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(temp_root).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_job_dir = entry
            .file_name()
            .to_str()
            .is_some_and(|name| Uuid::parse_str(name).is_ok());
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !(is_job_dir && is_dir) {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(dir = %entry.path().display(), error = %e, "Failed to remove temp dir"),
        }
    }
    removed
}
