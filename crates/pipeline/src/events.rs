//! Job lifecycle events.
//!
//! Each job pushes events into an unbounded `mpsc` channel owned by the
//! service, which re-broadcasts them to every subscriber.

use crate::metadata::JobMetadata;
use crate::progress::{PipelineStage, ProgressObserver, ProgressSnapshot};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// An event scoped to one job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEventKind {
    Started {
        input: PathBuf,
    },
    Progress {
        snapshot: ProgressSnapshot,
    },
    ThumbnailReady {
        path: PathBuf,
    },
    SegmentReady {
        rendition: String,
        path: PathBuf,
        index: Option<u32>,
    },
    Warning {
        stage: PipelineStage,
        message: String,
    },
    Complete {
        metadata: Box<JobMetadata>,
    },
    Error {
        stage: PipelineStage,
        message: String,
    },
    Cancelled,
}

impl JobEventKind {
    /// Whether this event ends the job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::Complete { .. } | JobEventKind::Error { .. } | JobEventKind::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Started { .. } => "started",
            JobEventKind::Progress { .. } => "progress",
            JobEventKind::ThumbnailReady { .. } => "thumbnail-ready",
            JobEventKind::SegmentReady { .. } => "segment-ready",
            JobEventKind::Warning { .. } => "warning",
            JobEventKind::Complete { .. } => "complete",
            JobEventKind::Error { .. } => "error",
            JobEventKind::Cancelled => "cancelled",
        }
    }
}

/// Sending half of a job's event channel
pub type EventSender = mpsc::UnboundedSender<JobEvent>;

/// Job-scoped wrapper around an [`EventSender`]
#[derive(Debug, Clone)]
pub struct EventEmitter {
    job_id: String,
    tx: EventSender,
}

impl EventEmitter {
    pub fn new(job_id: impl Into<String>, tx: EventSender) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn emit(&self, kind: JobEventKind) {
        // A closed channel means the service is gone; nothing left to tell
        let _ = self.tx.send(JobEvent {
            job_id: self.job_id.clone(),
            kind,
        });
    }
}

impl ProgressObserver for EventEmitter {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.emit(JobEventKind::Progress {
            snapshot: snapshot.clone(),
        });
    }
}
