//! One video's encoding pipeline.
//!
//! An [`EncodingJob`] walks a fixed sequence of stages:
//! probe, hero thumbnail, plan, encode, storyboard, captions, bitrate
//! reconciliation, manifest, metadata, finalize. Renditions encode in parallel
//! under a per-job semaphore; every other stage runs alone. Thumbnail,
//! storyboard and captions are best-effort and only produce warnings.
//!
//! Cancellation is synchronous from the caller's point of view: the status
//! flips to `cancelled`, SIGTERM goes out and the event is emitted before
//! [`EncodingJob::cancel`] returns. The full kill cascade and directory
//! removal run in a background task.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::{
    build_audio_extract_invocation, build_rendition_invocation, build_storyboard_invocation,
    build_thumbnail_invocation, build_transcribe_invocation, ffmpeg::INIT_SEGMENT,
    ffmpeg::STORYBOARD_NAME, ffmpeg::THUMBNAIL_NAME, plan_storyboard, run_encoder, run_tool,
    EncodeError, RenditionEncodeParams, StoryboardLayout,
};
use crate::events::{EventEmitter, EventSender, JobEventKind};
use crate::ladder::{plan_ladder, PlanError, RenditionPlan, Rung, SourceDimensions};
use crate::manifest::{
    generate_master_playlist, write_master_playlist, ManifestError, MASTER_PLAYLIST,
};
use crate::metadata::{
    average_bitrate_kbps, directory_totals, to_url_path, write_json, JobMetadata, MetadataError,
    RenditionMetadata, METADATA_FILE, STORYBOARD_JSON,
};
use crate::presets::Codec;
use crate::probe::{build_probe_invocation, parse_ffprobe_output, ProbeError, SourceInfo};
use crate::progress::{PipelineStage, ProgressError, ProgressSnapshot, ProgressTracker, StageDetail};
use crate::supervisor::{ProcessLabel, ProcessSupervisor};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const THUMBNAILS_DIR: &str = "thumbnails";
const CAPTIONS_DIR: &str = "captions";
const CAPTIONS_STEM: &str = "captions";
const AUDIO_EXTRACT_NAME: &str = "audio.wav";

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for the finalize stage
#[derive(Debug, Error)]
pub enum FinalizationError {
    #[error("Expected output missing: {0}")]
    MissingArtifact(PathBuf),

    #[error("Failed to rewrite metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What went wrong inside a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Finalization(#[from] FinalizationError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error("Tool reported success but {0} was not written")]
    MissingOutput(PathBuf),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stage-scoped pipeline failure
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct JobError {
    pub stage: PipelineStage,
    #[source]
    pub source: StageError,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, StageError::Cancelled)
    }
}

trait AtStage<T> {
    fn at(self, stage: PipelineStage) -> Result<T, JobError>;
}

impl<T, E: Into<StageError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: PipelineStage) -> Result<T, JobError> {
        self.map_err(|e| JobError {
            stage,
            source: e.into(),
        })
    }
}

/// Service-wide settings every job reads
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub encoder: PathBuf,
    pub prober: PathBuf,
    pub transcriber: Option<PathBuf>,
    pub transcriber_model: Option<PathBuf>,
    pub output_root: PathBuf,
    pub temp_root: PathBuf,
    pub segment_duration_secs: u32,
    pub codec: Codec,
    pub rungs: Vec<Rung>,
    /// Concurrent encoder invocations inside one job
    pub renditions_per_job: usize,
}

impl JobSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            encoder: cfg.binaries.encoder.clone(),
            prober: cfg.binaries.prober.clone(),
            transcriber: cfg.binaries.transcriber.clone(),
            transcriber_model: cfg.binaries.transcriber_model.clone(),
            output_root: cfg.output.root.clone(),
            temp_root: cfg.output.temp_root.clone(),
            segment_duration_secs: cfg.output.segment_duration_secs.max(1),
            codec: cfg.output.codec.into(),
            rungs: cfg.ladder.rungs.iter().copied().map(Rung::from).collect(),
            renditions_per_job: plan.renditions_per_job.max(1) as usize,
        }
    }
}

/// Per-submission overrides
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Codec family; the service default when None
    pub codec: Option<Codec>,
    /// Ladder rungs; the configured ladder when None
    pub rungs: Option<Vec<Rung>>,
    pub skip_captions: bool,
}

struct JobState {
    status: JobStatus,
    renditions: Vec<RenditionPlan>,
    metadata: Option<JobMetadata>,
    error: Option<String>,
}

/// Per-rendition fractions for the encode stage
struct EncodeProgress {
    fractions: Mutex<Vec<f64>>,
    completed: AtomicUsize,
}

impl EncodeProgress {
    fn new(total: usize) -> Self {
        Self {
            fractions: Mutex::new(vec![0.0; total]),
            completed: AtomicUsize::new(0),
        }
    }

    /// Record a rendition fraction and return the stage mean
    fn record(&self, index: usize, fraction: f64) -> f64 {
        let mut fractions = self.fractions.lock();
        if let Some(slot) = fractions.get_mut(index) {
            *slot = slot.max(fraction.clamp(0.0, 1.0));
        }
        fractions.iter().sum::<f64>() / fractions.len().max(1) as f64
    }

    fn finish(&self, index: usize) -> (f64, usize) {
        let overall = self.record(index, 1.0);
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        (overall, completed)
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn total(&self) -> usize {
        self.fractions.lock().len()
    }
}

/// One video moving through the pipeline
pub struct EncodingJob {
    id: String,
    input: PathBuf,
    output_dir: PathBuf,
    temp_dir: PathBuf,
    created_at: DateTime<Utc>,
    settings: Arc<JobSettings>,
    options: JobOptions,
    supervisor: Arc<ProcessSupervisor>,
    tracker: ProgressTracker,
    events: EventEmitter,
    state: Mutex<JobState>,
    cancelled: AtomicBool,
    /// True while `encode` is executing
    running: watch::Sender<bool>,
}

impl EncodingJob {
    pub fn new(
        id: impl Into<String>,
        input: impl Into<PathBuf>,
        settings: Arc<JobSettings>,
        options: JobOptions,
        supervisor: Arc<ProcessSupervisor>,
        events: EventSender,
    ) -> Arc<Self> {
        let id = id.into();
        let emitter = EventEmitter::new(id.clone(), events);
        let tracker = ProgressTracker::for_pipeline();
        tracker.subscribe(Arc::new(emitter.clone()));
        let (running, _) = watch::channel(false);

        Arc::new(Self {
            output_dir: settings.output_root.join(&id),
            temp_dir: settings.temp_root.join(&id),
            id,
            input: input.into(),
            created_at: Utc::now(),
            settings,
            options,
            supervisor,
            tracker,
            events: emitter,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                renditions: Vec::new(),
                metadata: None,
                error: None,
            }),
            cancelled: AtomicBool::new(false),
            running,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn renditions(&self) -> Vec<RenditionPlan> {
        self.state.lock().renditions.clone()
    }

    /// Metadata once the job completed
    pub fn metadata(&self) -> Option<JobMetadata> {
        self.state.lock().metadata.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    /// Run the pipeline to a terminal status.
    ///
    /// Returns immediately if the job is no longer pending.
    pub async fn encode(self: Arc<Self>) -> JobStatus {
        {
            let mut state = self.state.lock();
            if state.status != JobStatus::Pending {
                return state.status;
            }
            state.status = JobStatus::Processing;
            self.running.send_replace(true);
        }

        info!(job_id = %self.id, input = %self.input.display(), "Job started");
        self.events.emit(JobEventKind::Started {
            input: self.input.clone(),
        });

        let started = Instant::now();
        let result = self.run_pipeline(started).await;
        let status = self.finish(result);

        if status == JobStatus::Error {
            // stop sibling encoders and anything they left behind
            self.supervisor.kill_job(&self.id).await;
        }
        if status != JobStatus::Cancelled {
            self.supervisor.forget_job(&self.id);
        }
        self.running.send_replace(false);
        status
    }

    /// Cancel the job.
    ///
    /// The status, SIGTERM and the `cancelled` event happen before this
    /// returns. The handle resolves once the kill cascade finished and the
    /// job's directories are gone. Returns None for jobs already terminal.
    pub fn cancel(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return None;
            }
            state.status = JobStatus::Cancelled;
            self.cancelled.store(true, Ordering::SeqCst);
        }

        let signaled = self.supervisor.begin_termination(&self.id);
        info!(job_id = %self.id, signaled, "Job cancelled");
        self.events.emit(JobEventKind::Cancelled);

        let job = Arc::clone(self);
        Some(tokio::spawn(async move { job.cleanup_after_cancel().await }))
    }

    async fn cleanup_after_cancel(&self) {
        let report = self.supervisor.kill_job(&self.id).await;
        debug!(
            job_id = %self.id,
            killed = report.killed,
            residual = report.residual,
            "Cancel cascade finished"
        );

        let mut running = self.running.subscribe();
        let _ = running.wait_for(|r| !*r).await;

        for dir in [&self.temp_dir, &self.output_dir] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => debug!(job_id = %self.id, dir = %dir.display(), "Removed job directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(job_id = %self.id, dir = %dir.display(), error = %e, "Failed to remove job directory")
                }
            }
        }
        self.supervisor.forget_job(&self.id);
    }

    fn finish(&self, result: Result<JobMetadata, JobError>) -> JobStatus {
        let mut state = self.state.lock();
        if state.status == JobStatus::Cancelled {
            return JobStatus::Cancelled;
        }

        match result {
            Ok(metadata) => {
                state.status = JobStatus::Complete;
                state.metadata = Some(metadata.clone());
                drop(state);

                info!(
                    job_id = %self.id,
                    renditions = metadata.renditions.len(),
                    output_size = metadata.output_size,
                    encoding_secs = metadata.encoding_duration,
                    "Job complete"
                );
                self.events.emit(JobEventKind::Complete {
                    metadata: Box::new(metadata),
                });
                JobStatus::Complete
            }
            Err(e) => {
                state.status = JobStatus::Error;
                state.error = Some(e.to_string());
                drop(state);

                error!(job_id = %self.id, stage = %e.stage, error = %e.source, "Job failed");
                self.events.emit(JobEventKind::Error {
                    stage: e.stage,
                    message: e.source.to_string(),
                });
                JobStatus::Error
            }
        }
    }

    async fn run_pipeline(self: &Arc<Self>, started: Instant) -> Result<JobMetadata, JobError> {
        use PipelineStage::*;

        self.start(Probe)?;
        self.prepare_directories().await.at(Probe)?;
        let source = self.probe().await.at(Probe)?;
        self.complete(Probe)?;

        let mut metadata = JobMetadata::new(&self.id, &source, self.created_at);

        self.start(Thumbnail)?;
        match self.thumbnail(&source).await {
            Ok(path) => {
                metadata.thumbnail = Some(format!("{}/{}", THUMBNAILS_DIR, THUMBNAIL_NAME));
                self.events.emit(JobEventKind::ThumbnailReady { path });
            }
            Err(e) => self.warn_stage(Thumbnail, format!("Hero thumbnail failed: {}", e), &mut metadata),
        }
        self.complete(Thumbnail)?;

        self.start(Plan)?;
        let codec = self.options.codec.unwrap_or(self.settings.codec);
        let rungs = self
            .options
            .rungs
            .as_deref()
            .unwrap_or(&self.settings.rungs);
        let dims = SourceDimensions {
            width: source.video.width,
            height: source.video.height,
            fps: source.video.fps,
        };
        let plan = plan_ladder(dims, rungs, codec).at(Plan)?;
        for warning in &plan.warnings {
            self.warn_stage(Plan, warning.clone(), &mut metadata);
        }
        for rendition in &plan.renditions {
            tokio::fs::create_dir_all(self.output_dir.join(&rendition.relative_dir))
                .await
                .at(Plan)?;
        }
        self.state.lock().renditions = plan.renditions.clone();
        self.complete(Plan)?;

        self.start(Encode)?;
        self.encode_renditions(&plan.renditions, &source).await?;
        self.complete(Encode)?;

        self.start(Storyboard)?;
        match self.storyboard(&source).await {
            Ok(layout) => metadata.storyboard = Some(layout),
            Err(e) => self.warn_stage(Storyboard, format!("Storyboard failed: {}", e), &mut metadata),
        }
        self.complete(Storyboard)?;

        self.start(Captions)?;
        match self.captions(&source).await {
            Ok(Some(path)) => metadata.captions = Some(path),
            Ok(None) => {}
            Err(e) => self.warn_stage(Captions, format!("Captions failed: {}", e), &mut metadata),
        }
        self.complete(Captions)?;

        self.start(Bitrate)?;
        metadata.renditions = self
            .measure_renditions(&plan.renditions, &source)
            .await
            .at(Bitrate)?;
        self.complete(Bitrate)?;

        self.start(Manifest)?;
        let playlist = generate_master_playlist(&metadata.renditions, codec, source.audio.is_some());
        write_master_playlist(&self.output_dir, &playlist)
            .await
            .at(Manifest)?;
        self.complete(Manifest)?;

        self.start(Metadata)?;
        metadata.encoding_duration = started.elapsed().as_secs_f64();
        write_json(&self.output_dir.join(METADATA_FILE), &metadata)
            .await
            .at(Metadata)?;
        self.complete(Metadata)?;

        self.start(Finalize)?;
        self.finalize(&plan.renditions, &mut metadata)
            .await
            .at(Finalize)?;
        self.complete(Finalize)?;

        Ok(metadata)
    }

    fn check_cancelled(&self, stage: PipelineStage) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError {
                stage,
                source: StageError::Cancelled,
            })
        } else {
            Ok(())
        }
    }

    fn start(&self, stage: PipelineStage) -> Result<(), JobError> {
        self.check_cancelled(stage)?;
        debug!(job_id = %self.id, stage = %stage, "Stage started");
        self.tracker.start_stage(stage.as_str()).at(stage)
    }

    fn complete(&self, stage: PipelineStage) -> Result<(), JobError> {
        self.tracker.complete_stage(stage.as_str()).at(stage)
    }

    fn warn_stage(&self, stage: PipelineStage, message: String, metadata: &mut JobMetadata) {
        if self.is_cancelled() {
            return;
        }
        warn!(job_id = %self.id, stage = %stage, "{}", message);
        metadata.warnings.push(format!("{}: {}", stage, message));
        self.events.emit(JobEventKind::Warning { stage, message });
    }

    async fn prepare_directories(&self) -> std::io::Result<()> {
        self.supervisor.set_signature(
            &self.id,
            vec![self.output_dir.clone(), self.temp_dir.clone()],
        );
        tokio::fs::create_dir_all(self.output_dir.join(THUMBNAILS_DIR)).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<SourceInfo, ProbeError> {
        let invocation = build_probe_invocation(&self.settings.prober, &self.input);
        let output = self
            .supervisor
            .run_to_completion(&self.id, ProcessLabel::Probe, &invocation)
            .await?;

        if !output.status.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let source = parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!(
            job_id = %self.id,
            duration = source.duration,
            width = source.video.width,
            height = source.video.height,
            fps = source.video.fps,
            has_audio = source.audio.is_some(),
            "Probed source"
        );
        Ok(source)
    }

    async fn thumbnail(&self, source: &SourceInfo) -> Result<PathBuf, StageError> {
        let path = self.output_dir.join(THUMBNAILS_DIR).join(THUMBNAIL_NAME);
        let invocation = build_thumbnail_invocation(
            &self.settings.encoder,
            &self.input,
            &path,
            source.duration,
            &self.id,
        );
        run_tool(&self.supervisor, &self.id, ProcessLabel::Thumbnail, &invocation).await?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StageError::MissingOutput(path));
        }
        Ok(path)
    }

    async fn encode_renditions(
        self: &Arc<Self>,
        renditions: &[RenditionPlan],
        source: &SourceInfo,
    ) -> Result<(), JobError> {
        let stage = PipelineStage::Encode;
        if renditions.is_empty() {
            return Ok(());
        }

        let limit = Arc::new(Semaphore::new(self.settings.renditions_per_job.max(1)));
        let progress = Arc::new(EncodeProgress::new(renditions.len()));
        let mut tasks = JoinSet::new();

        for (index, rendition) in renditions.iter().cloned().enumerate() {
            let job = Arc::clone(self);
            let limit = Arc::clone(&limit);
            let progress = Arc::clone(&progress);
            let fps = source.video.fps;
            let duration = source.duration;
            let has_audio = source.audio.is_some();

            tasks.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|e| StageError::Task(e.to_string()))?;
                if job.is_cancelled() {
                    return Err(StageError::Cancelled);
                }

                let output_dir = job.output_dir.join(&rendition.relative_dir);
                let invocation = build_rendition_invocation(
                    &job.settings.encoder,
                    &RenditionEncodeParams {
                        input: &job.input,
                        output_dir: &output_dir,
                        rendition: &rendition,
                        fps,
                        segment_duration_secs: job.settings.segment_duration_secs,
                        has_audio,
                        job_id: &job.id,
                    },
                );
                debug!(job_id = %job.id, rendition = %rendition.id, "Rendition encode starting");

                let on_progress = {
                    let job = Arc::clone(&job);
                    let progress = Arc::clone(&progress);
                    let name = rendition.id.clone();
                    move |fraction: f64| {
                        let overall = progress.record(index, fraction);
                        job.report_encode(&name, fraction, overall, progress.completed(), progress.total());
                    }
                };
                let on_segment = {
                    let events = job.events.clone();
                    let name = rendition.id.clone();
                    move |opened: &crate::encode::SegmentOpened| {
                        events.emit(JobEventKind::SegmentReady {
                            rendition: name.clone(),
                            path: opened.path.clone(),
                            index: opened.index,
                        });
                    }
                };

                let outcome = run_encoder(
                    &job.supervisor,
                    &job.id,
                    &invocation,
                    duration,
                    on_progress,
                    on_segment,
                )
                .await?;

                let (overall, completed) = progress.finish(index);
                job.report_encode(&rendition.id, 1.0, overall, completed, progress.total());
                info!(
                    job_id = %job.id,
                    rendition = %rendition.id,
                    segments = outcome.segments,
                    "Rendition encoded"
                );
                Ok::<(), StageError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| StageError::Task(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = result {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                let source = if self.is_cancelled() {
                    StageError::Cancelled
                } else {
                    e
                };
                return Err(JobError { stage, source });
            }
        }
        Ok(())
    }

    fn report_encode(&self, rendition: &str, fraction: f64, overall: f64, completed: usize, total: usize) {
        let detail = StageDetail::Encode {
            rendition: rendition.to_string(),
            fraction,
            completed,
            total,
        };
        if let Err(e) = self
            .tracker
            .update_stage(PipelineStage::Encode.as_str(), overall, Some(detail))
        {
            debug!(job_id = %self.id, error = %e, "Progress update rejected");
        }
    }

    async fn storyboard(&self, source: &SourceInfo) -> Result<StoryboardLayout, StageError> {
        let layout = plan_storyboard(source.duration, source.video.width, source.video.height);
        let sprite = self.output_dir.join(THUMBNAILS_DIR).join(STORYBOARD_NAME);
        let invocation = build_storyboard_invocation(
            &self.settings.encoder,
            &self.input,
            &sprite,
            &layout,
            &self.id,
        );
        run_tool(&self.supervisor, &self.id, ProcessLabel::Storyboard, &invocation).await?;
        write_json(
            &self.output_dir.join(THUMBNAILS_DIR).join(STORYBOARD_JSON),
            &layout,
        )
        .await?;
        Ok(layout)
    }

    /// Returns the captions path relative to the job root, or None when skipped
    async fn captions(&self, source: &SourceInfo) -> Result<Option<String>, StageError> {
        let stage = PipelineStage::Captions.as_str();
        let transcriber = match (&self.settings.transcriber, self.options.skip_captions) {
            (Some(t), false) => t,
            _ => {
                debug!(job_id = %self.id, "Captions skipped: no transcriber");
                return Ok(None);
            }
        };
        if source.audio.is_none() {
            debug!(job_id = %self.id, "Captions skipped: source has no audio");
            return Ok(None);
        }

        let audio = self.temp_dir.join(AUDIO_EXTRACT_NAME);
        let extract =
            build_audio_extract_invocation(&self.settings.encoder, &self.input, &audio, &self.id);
        run_tool(&self.supervisor, &self.id, ProcessLabel::Audio, &extract).await?;
        self.tracker.update_stage(stage, 0.5, None)?;

        let captions_dir = self.output_dir.join(CAPTIONS_DIR);
        tokio::fs::create_dir_all(&captions_dir).await?;
        let stem = captions_dir.join(CAPTIONS_STEM);
        let transcribe = build_transcribe_invocation(
            transcriber,
            self.settings.transcriber_model.as_deref(),
            &audio,
            &stem,
        );
        run_tool(&self.supervisor, &self.id, ProcessLabel::Captions, &transcribe).await?;

        let vtt = stem.with_extension("vtt");
        if !tokio::fs::try_exists(&vtt).await? {
            return Err(StageError::MissingOutput(vtt));
        }
        Ok(Some(format!("{}/{}.vtt", CAPTIONS_DIR, CAPTIONS_STEM)))
    }

    /// Measure each rendition directory and derive its actual video bitrate.
    ///
    /// Segments carry muxed audio, so the audio bitrate is taken back out of
    /// the measured total.
    async fn measure_renditions(
        &self,
        renditions: &[RenditionPlan],
        source: &SourceInfo,
    ) -> Result<Vec<RenditionMetadata>, StageError> {
        let dirs: Vec<PathBuf> = renditions
            .iter()
            .map(|r| self.output_dir.join(&r.relative_dir))
            .collect();
        let totals = tokio::task::spawn_blocking(move || {
            dirs.iter().map(|d| directory_totals(d)).collect::<Vec<_>>()
        })
        .await
        .map_err(|e| StageError::Task(e.to_string()))?;

        let has_audio = source.audio.is_some();
        Ok(renditions
            .iter()
            .zip(totals)
            .map(|(r, totals)| {
                let actual_bitrate = average_bitrate_kbps(totals.bytes, source.duration)
                    .map(|kbps| {
                        if has_audio {
                            kbps.saturating_sub(r.audio_bitrate_kbps)
                        } else {
                            kbps
                        }
                    })
                    .filter(|kbps| *kbps > 0);
                RenditionMetadata {
                    name: r.id.clone(),
                    codec: r.codec,
                    width: r.width,
                    height: r.height,
                    target_bitrate: r.max_bitrate_kbps,
                    actual_bitrate,
                    profile: r.profile.clone(),
                    level: r.level.clone(),
                    playlist_path: to_url_path(&r.playlist_path()),
                    segment_count: totals.segments,
                    total_size: totals.bytes,
                    segment_duration: self.settings.segment_duration_secs,
                    frame_rate: source.video.fps,
                }
            })
            .collect())
    }

    /// Verify artifacts, drop the temp dir and record output totals.
    ///
    /// Totals are taken before metadata.json is rewritten with them.
    async fn finalize(
        &self,
        renditions: &[RenditionPlan],
        metadata: &mut JobMetadata,
    ) -> Result<(), FinalizationError> {
        let mut expected = vec![
            self.output_dir.join(MASTER_PLAYLIST),
            self.output_dir.join(METADATA_FILE),
        ];
        for r in renditions {
            expected.push(self.output_dir.join(r.playlist_path()));
            expected.push(self.output_dir.join(&r.relative_dir).join(INIT_SEGMENT));
        }
        for path in expected {
            if !tokio::fs::try_exists(&path).await? {
                return Err(FinalizationError::MissingArtifact(path));
            }
        }

        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let root = self.output_dir.clone();
        let totals = tokio::task::spawn_blocking(move || directory_totals(&root))
            .await
            .map_err(std::io::Error::other)?;
        metadata.output_size = totals.bytes;
        metadata.file_count = totals.files;
        write_json(&self.output_dir.join(METADATA_FILE), metadata).await?;
        Ok(())
    }
}

impl std::fmt::Debug for EncodingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodingJob")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("status", &self.status())
            .finish()
    }
}
