//! Weighted progress aggregation for a job.
//!
//! A tracker owns a fixed, ordered table of named stages. Each stage moves
//! `pending -> active -> complete` and carries a fractional progress. The
//! global fraction is the weighted sum of stage progress, held against a
//! running maximum so that it never goes backwards even when concurrent
//! rendition updates arrive out of order.
//!
//! Every mutation pushes a [`ProgressSnapshot`] to the subscribed observers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Tolerance used when checking that weights sum to 1
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Error type for progress tracking
#[derive(Debug, Error, PartialEq)]
pub enum ProgressError {
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Invalid stage weights: {0}")]
    InvalidWeights(String),
}

/// The ordered stages of the encoding pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Probe,
    Thumbnail,
    Plan,
    Encode,
    Storyboard,
    Captions,
    Bitrate,
    Manifest,
    Metadata,
    Finalize,
}

impl PipelineStage {
    /// All stages in execution order
    pub const ALL: [PipelineStage; 10] = [
        PipelineStage::Probe,
        PipelineStage::Thumbnail,
        PipelineStage::Plan,
        PipelineStage::Encode,
        PipelineStage::Storyboard,
        PipelineStage::Captions,
        PipelineStage::Bitrate,
        PipelineStage::Manifest,
        PipelineStage::Metadata,
        PipelineStage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Probe => "probe",
            PipelineStage::Thumbnail => "thumbnail",
            PipelineStage::Plan => "plan",
            PipelineStage::Encode => "encode",
            PipelineStage::Storyboard => "storyboard",
            PipelineStage::Captions => "captions",
            PipelineStage::Bitrate => "bitrate",
            PipelineStage::Manifest => "manifest",
            PipelineStage::Metadata => "metadata",
            PipelineStage::Finalize => "finalize",
        }
    }

    /// Default share of the global progress bar
    pub fn default_weight(&self) -> f64 {
        match self {
            PipelineStage::Probe => 0.03,
            PipelineStage::Thumbnail => 0.02,
            PipelineStage::Plan => 0.01,
            PipelineStage::Encode => 0.80,
            PipelineStage::Storyboard => 0.04,
            PipelineStage::Captions => 0.03,
            PipelineStage::Bitrate => 0.02,
            PipelineStage::Manifest => 0.01,
            PipelineStage::Metadata => 0.01,
            PipelineStage::Finalize => 0.03,
        }
    }

    /// Whether a failure in this stage is tolerated
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            PipelineStage::Thumbnail | PipelineStage::Storyboard | PipelineStage::Captions
        )
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Active,
    Complete,
}

/// Name and weight of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub weight: f64,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Stage-specific detail carried with a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StageDetail {
    /// Encode stage: the rendition that just reported
    #[serde(rename_all = "camelCase")]
    Encode {
        rendition: String,
        fraction: f64,
        completed: usize,
        total: usize,
    },
    /// Free-form note for other stages
    Message { text: String },
}

/// Per-stage row of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSnapshot {
    pub name: String,
    pub weight: f64,
    pub progress: f64,
    pub status: StageStatus,
    /// Seconds since the stage became active
    pub elapsed_secs: Option<f64>,
}

/// Immutable view of a tracker at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Global fraction in [0, 1]
    pub global: f64,
    pub active_stage: Option<String>,
    pub stages: Vec<StageSnapshot>,
    pub detail: Option<StageDetail>,
}

impl ProgressSnapshot {
    /// Global progress as a 0-100 percentage
    pub fn percent(&self) -> f64 {
        self.global * 100.0
    }
}

/// Receives every snapshot a tracker emits
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl ProgressObserver for mpsc::UnboundedSender<ProgressSnapshot> {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(snapshot.clone());
    }
}

#[derive(Debug)]
struct Stage {
    name: String,
    weight: f64,
    progress: f64,
    status: StageStatus,
    started_at: Option<Instant>,
}

struct Inner {
    stages: Vec<Stage>,
    global: f64,
    active: Option<usize>,
    detail: Option<StageDetail>,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

/// Weighted multi-stage progress aggregator.
///
/// Safe to share between concurrent rendition tasks; all mutation happens
/// under one lock and observers are notified in mutation order.
pub struct ProgressTracker {
    inner: Mutex<Inner>,
}

impl ProgressTracker {
    /// Create a tracker from an ordered stage table.
    ///
    /// Weights must each lie in [0, 1] and sum to 1. Names must be unique.
    pub fn new(specs: Vec<StageSpec>) -> Result<Self, ProgressError> {
        validate_weights(&specs)?;
        Ok(Self::build(specs))
    }

    /// Tracker over the standard pipeline stages with their default weights
    pub fn for_pipeline() -> Self {
        Self::build(
            PipelineStage::ALL
                .iter()
                .map(|s| StageSpec::new(s.as_str(), s.default_weight()))
                .collect(),
        )
    }

    fn build(specs: Vec<StageSpec>) -> Self {
        let stages = specs
            .into_iter()
            .map(|s| Stage {
                name: s.name,
                weight: s.weight,
                progress: 0.0,
                status: StageStatus::Pending,
                started_at: None,
            })
            .collect();

        Self {
            inner: Mutex::new(Inner {
                stages,
                global: 0.0,
                active: None,
                detail: None,
                observers: Vec::new(),
            }),
        }
    }

    /// Register an observer; it receives every later snapshot
    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) {
        self.inner.lock().observers.push(observer);
    }

    /// Mark a stage active and record its start time
    pub fn start_stage(&self, name: &str) -> Result<(), ProgressError> {
        let mut inner = self.inner.lock();
        let idx = inner.index_of(name)?;

        let stage = &mut inner.stages[idx];
        if stage.status == StageStatus::Pending {
            stage.status = StageStatus::Active;
            stage.started_at = Some(Instant::now());
        }
        inner.active = Some(idx);
        inner.detail = None;
        inner.emit();
        Ok(())
    }

    /// Set a stage's fractional progress.
    ///
    /// The fraction is clamped to [0, 1]. A stage's own progress never
    /// regresses, and neither does the global fraction.
    pub fn update_stage(
        &self,
        name: &str,
        fraction: f64,
        detail: Option<StageDetail>,
    ) -> Result<(), ProgressError> {
        let mut inner = self.inner.lock();
        let idx = inner.index_of(name)?;
        let fraction = clamp_fraction(fraction);

        let stage = &mut inner.stages[idx];
        if stage.status == StageStatus::Pending {
            stage.status = StageStatus::Active;
            stage.started_at = Some(Instant::now());
        }
        if stage.status != StageStatus::Complete {
            stage.progress = stage.progress.max(fraction);
        }
        if detail.is_some() {
            inner.detail = detail;
        }
        inner.recompute();
        inner.emit();
        Ok(())
    }

    /// Force a stage to complete, along with every stage ordered before it
    pub fn complete_stage(&self, name: &str) -> Result<(), ProgressError> {
        let mut inner = self.inner.lock();
        let idx = inner.index_of(name)?;

        for stage in inner.stages.iter_mut().take(idx + 1) {
            stage.progress = 1.0;
            stage.status = StageStatus::Complete;
        }
        if inner.active.is_some_and(|a| a <= idx) {
            inner.active = None;
        }
        inner.detail = None;
        inner.recompute();
        inner.emit();
        Ok(())
    }

    /// Current state without mutating anything
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().snapshot()
    }

    /// Current global fraction
    pub fn global(&self) -> f64 {
        self.inner.lock().global
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProgressTracker")
            .field("global", &inner.global)
            .field("stages", &inner.stages)
            .finish()
    }
}

impl Inner {
    fn index_of(&self, name: &str) -> Result<usize, ProgressError> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| ProgressError::UnknownStage(name.to_string()))
    }

    fn recompute(&mut self) {
        let sum: f64 = self.stages.iter().map(|s| s.progress * s.weight).sum();
        self.global = clamp_fraction(sum).max(self.global);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            global: self.global,
            active_stage: self.active.map(|i| self.stages[i].name.clone()),
            stages: self
                .stages
                .iter()
                .map(|s| StageSnapshot {
                    name: s.name.clone(),
                    weight: s.weight,
                    progress: s.progress,
                    status: s.status,
                    elapsed_secs: s.started_at.map(|t| t.elapsed().as_secs_f64()),
                })
                .collect(),
            detail: self.detail.clone(),
        }
    }

    fn emit(&self) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for observer in &self.observers {
            observer.on_progress(&snapshot);
        }
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn validate_weights(specs: &[StageSpec]) -> Result<(), ProgressError> {
    if specs.is_empty() {
        return Err(ProgressError::InvalidWeights("no stages".to_string()));
    }
    for (i, spec) in specs.iter().enumerate() {
        if !(0.0..=1.0).contains(&spec.weight) {
            return Err(ProgressError::InvalidWeights(format!(
                "stage {} has weight {}",
                spec.name, spec.weight
            )));
        }
        if specs[..i].iter().any(|other| other.name == spec.name) {
            return Err(ProgressError::InvalidWeights(format!(
                "duplicate stage {}",
                spec.name
            )));
        }
    }
    let total: f64 = specs.iter().map(|s| s.weight).sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(ProgressError::InvalidWeights(format!(
            "weights sum to {}",
            total
        )));
    }
    Ok(())
}
