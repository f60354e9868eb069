//! Bitrate ladder planning.
//!
//! Turns the source dimensions and the user's enabled rungs into concrete
//! per-rendition encode parameters.

use crate::config::RungConfig;
use crate::presets::{
    audio_bitrate_kbps, profile_level, quality_preset, Codec, QualityLevel, BUFFER_SIZE_FACTOR,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for ladder planning
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    /// Source narrower than two pixels or with zero height
    #[error("Source has invalid dimensions {width}x{height}")]
    InvalidSource { width: u32, height: u32 },
}

/// Source video properties relevant to planning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceDimensions {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// One requested rung of the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    pub target_height: u32,
    pub quality: QualityLevel,
    pub enabled: bool,
}

impl From<RungConfig> for Rung {
    fn from(cfg: RungConfig) -> Self {
        Self {
            target_height: cfg.height,
            quality: QualityLevel::clamped(cfg.quality),
            enabled: cfg.enabled,
        }
    }
}

/// Concrete encode parameters for one rendition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionPlan {
    /// Unique id within the job, e.g. `720p`
    pub id: String,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub profile: String,
    pub level: String,
    pub crf: u8,
    pub max_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    pub audio_bitrate_kbps: u32,
    /// Output directory relative to the job output root
    pub relative_dir: PathBuf,
}

impl RenditionPlan {
    /// Playlist path relative to the job output root
    pub fn playlist_path(&self) -> PathBuf {
        self.relative_dir.join("playlist.m3u8")
    }
}

/// Result of planning: renditions plus non-fatal warnings
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LadderPlan {
    pub renditions: Vec<RenditionPlan>,
    pub warnings: Vec<String>,
}

/// Plan the renditions for a source.
///
/// Heights are clamped to the source height and widths follow the source
/// aspect ratio rounded down to an even number. Zero enabled rungs is not an
/// error: the plan is empty and carries a warning.
pub fn plan_ladder(
    source: SourceDimensions,
    rungs: &[Rung],
    codec: Codec,
) -> Result<LadderPlan, PlanError> {
    if source.width < 2 || source.height == 0 {
        return Err(PlanError::InvalidSource {
            width: source.width,
            height: source.height,
        });
    }

    let fps = if source.fps.is_finite() && source.fps > 0.0 {
        source.fps
    } else {
        30.0
    };

    let mut plan = LadderPlan::default();
    let mut used_ids: HashSet<String> = HashSet::new();

    for rung in rungs.iter().filter(|r| r.enabled) {
        if rung.target_height == 0 {
            plan.warnings.push("Ignoring rung with zero target height".to_string());
            continue;
        }
        let height = rung.target_height.min(source.height);
        let width = scaled_even_width(source, height);

        if rung.target_height > source.height {
            plan.warnings.push(format!(
                "{}p rung clamped to source height {}",
                rung.target_height, source.height
            ));
        }

        let preset = quality_preset(codec, rung.quality);
        let pl = profile_level(codec, height);

        let baseline_bps = codec.bits_per_pixel() * (width as f64) * (height as f64) * fps;
        let max_bitrate_kbps = ((baseline_bps * preset.bitrate_multiplier) / 1000.0)
            .round()
            .max(1.0) as u32;
        let buffer_size_kbps = (max_bitrate_kbps as f64 * BUFFER_SIZE_FACTOR).round() as u32;

        let id = unique_id(&mut used_ids, format!("{}p", height));
        let relative_dir = PathBuf::from("renditions").join(codec.as_str()).join(&id);

        plan.renditions.push(RenditionPlan {
            id,
            codec,
            width,
            height,
            profile: pl.profile.to_string(),
            level: pl.level.to_string(),
            crf: preset.crf,
            max_bitrate_kbps,
            buffer_size_kbps,
            audio_bitrate_kbps: audio_bitrate_kbps(rung.target_height.min(source.height)),
            relative_dir,
        });
    }

    if plan.renditions.is_empty() {
        plan.warnings
            .push("No ladder rungs enabled; job will produce no playable variant".to_string());
    }

    Ok(plan)
}

/// Width preserving aspect ratio, rounded down to even, never above source
fn scaled_even_width(source: SourceDimensions, height: u32) -> u32 {
    let exact = (source.width as u64 * height as u64 / source.height as u64) as u32;
    let max_even = source.width & !1;
    (exact & !1).clamp(2, max_even)
}

fn unique_id(used: &mut HashSet<String>, base: String) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
