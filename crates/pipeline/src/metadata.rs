//! Job metadata: the `metadata.json` record written next to the master
//! playlist, plus the on-disk measurements that feed it.

use crate::encode::StoryboardLayout;
use crate::presets::Codec;
use crate::probe::{AudioStream, ContainerInfo, SourceInfo, VideoStream};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use thiserror::Error;
use walkdir::WalkDir;

pub const METADATA_FILE: &str = "metadata.json";
pub const STORYBOARD_JSON: &str = "storyboard.json";

/// Error type for metadata writing
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-rendition entry of metadata.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionMetadata {
    pub name: String,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Planned ceiling (kbps)
    pub target_bitrate: u32,
    /// Measured average (kbps), filled after encode
    pub actual_bitrate: Option<u32>,
    pub profile: String,
    pub level: String,
    /// Playlist path relative to the job root, `/` separated
    pub playlist_path: String,
    pub segment_count: u32,
    /// Bytes on disk for the rendition directory
    pub total_size: u64,
    pub segment_duration: u32,
    /// Source frame rate
    pub frame_rate: f64,
}

impl RenditionMetadata {
    /// Video bitrate used for ordering and BANDWIDTH
    pub fn effective_bitrate_kbps(&self) -> u32 {
        self.actual_bitrate.unwrap_or(self.target_bitrate)
    }
}

/// Contents of metadata.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub id: String,
    /// Source duration in seconds
    pub duration: f64,
    pub container: ContainerInfo,
    pub video: VideoStream,
    pub audio: Option<AudioStream>,
    pub renditions: Vec<RenditionMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storyboard: Option<StoryboardLayout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Wall-clock seconds spent encoding the job
    pub encoding_duration: f64,
    pub output_size: u64,
    pub file_count: u64,
}

impl JobMetadata {
    /// Metadata with source facts filled in and nothing measured yet
    pub fn new(id: impl Into<String>, source: &SourceInfo, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            duration: source.duration,
            container: source.container.clone(),
            video: source.video.clone(),
            audio: source.audio.clone(),
            renditions: Vec::new(),
            thumbnail: None,
            storyboard: None,
            captions: None,
            warnings: Vec::new(),
            created_at,
            encoding_duration: 0.0,
            output_size: 0,
            file_count: 0,
        }
    }
}

/// Size and file count of a directory tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryTotals {
    pub bytes: u64,
    pub files: u64,
    /// `.m4s` media segments
    pub segments: u32,
}

/// Walk a directory and total its regular files. Missing directories total zero.
pub fn directory_totals(dir: &Path) -> DirectoryTotals {
    let mut totals = DirectoryTotals::default();
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        totals.files += 1;
        totals.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        if entry.path().extension().and_then(|e| e.to_str()) == Some("m4s") {
            totals.segments += 1;
        }
    }
    totals
}

/// Average bitrate in kbps for `bytes` spread over `duration_secs`
pub fn average_bitrate_kbps(bytes: u64, duration_secs: f64) -> Option<u32> {
    if !(duration_secs.is_finite() && duration_secs > 0.0) || bytes == 0 {
        return None;
    }
    Some(((bytes as f64 * 8.0) / duration_secs / 1000.0).round() as u32)
}

/// Relative path rendered with `/` separators for playlists and JSON
pub fn to_url_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Write a value as pretty JSON
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MetadataError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
