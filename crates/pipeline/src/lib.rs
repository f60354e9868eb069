//! hls-forge
//!
//! Turns a source video into a multi-rendition HLS package (fMP4 segments,
//! variant playlists, a master playlist, thumbnail, storyboard, captions and
//! metadata) while supervising every external encoder process it starts.

pub mod concurrency;
pub mod encode;
pub mod events;
pub mod job;
pub mod ladder;
pub mod manifest;
pub mod metadata;
pub mod presets;
pub mod probe;
pub mod progress;
pub mod service;
pub mod startup;
pub mod status_server;
pub mod supervisor;
pub mod validation;

pub use hls_forge_config as config;
pub use hls_forge_config::Config;

pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use encode::{EncodeError, StoryboardLayout};
pub use events::{EventEmitter, JobEvent, JobEventKind};
pub use job::{EncodingJob, JobError, JobOptions, JobSettings, JobStatus, StageError};
pub use ladder::{plan_ladder, LadderPlan, PlanError, RenditionPlan, Rung, SourceDimensions};
pub use manifest::{generate_master_playlist, ManifestError, MASTER_PLAYLIST};
pub use metadata::{JobMetadata, MetadataError, RenditionMetadata};
pub use presets::{Codec, QualityLevel};
pub use probe::{parse_ffprobe_output, ProbeError, SourceInfo};
pub use progress::{PipelineStage, ProgressObserver, ProgressSnapshot, ProgressTracker};
pub use service::{
    CleanupReport, EncodingService, JobHandle, JobSummary, ServiceError, ServiceStatus,
};
pub use startup::{run_startup_checks, InitializationError};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use supervisor::{
    KillReport, ProcessLabel, ProcessRecord, ProcessSupervisor, ProcessTable, SysinfoProcessTable,
};
pub use validation::{InputValidator, ValidationError};
