//! Preset catalog: fixed tables mapping quality ordinals and target heights to
//! encoder parameters.
//!
//! Everything here is pure. The ladder planner and the encoder command builder
//! both read from these tables so that a rendition's planned parameters, its
//! encoder arguments and its manifest codec string always agree.

use crate::config::OutputCodec;
use serde::{Deserialize, Serialize};

/// Audio bitrate for renditions below the upgrade height (kbps)
pub const AUDIO_BITRATE_KBPS: u32 = 128;
/// Audio bitrate for renditions at or above the upgrade height (kbps)
pub const AUDIO_UPGRADE_BITRATE_KBPS: u32 = 192;
/// Target height at which audio is upgraded
pub const AUDIO_UPGRADE_MIN_HEIGHT: u32 = 1080;
/// Buffer size relative to the max bitrate
pub const BUFFER_SIZE_FACTOR: f64 = 1.5;

/// Video codec family of a rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Av1,
}

impl Codec {
    /// Directory name and metadata identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Av1 => "av1",
        }
    }

    /// Encoder library passed to `-c:v`
    pub fn encoder_library(&self) -> &'static str {
        match self {
            Codec::H264 => "libx264",
            Codec::Av1 => "libsvtav1",
        }
    }

    /// Target bits per pixel per frame used for the baseline bitrate
    pub fn bits_per_pixel(&self) -> f64 {
        match self {
            Codec::H264 => 0.08,
            Codec::Av1 => 0.05,
        }
    }

    /// Encoder speed preset
    pub fn speed_preset(&self) -> &'static str {
        match self {
            Codec::H264 => "medium",
            Codec::Av1 => "8",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OutputCodec> for Codec {
    fn from(codec: OutputCodec) -> Self {
        match codec {
            OutputCodec::H264 => Codec::H264,
            OutputCodec::Av1 => Codec::Av1,
        }
    }
}

/// Quality ordinal, 1 (smallest output) to 5 (best quality)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualityLevel(u8);

impl QualityLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Returns None outside 1..=5
    pub fn new(ordinal: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX)
            .contains(&ordinal)
            .then_some(Self(ordinal))
    }

    /// Clamps any ordinal into 1..=5
    pub fn clamped(ordinal: u8) -> Self {
        Self(ordinal.clamp(Self::MIN, Self::MAX))
    }

    pub fn ordinal(&self) -> u8 {
        self.0
    }
}

/// Rate-control parameters for one quality ordinal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPreset {
    pub crf: u8,
    pub bitrate_multiplier: f64,
}

/// CRF and bitrate multiplier for a quality ordinal.
///
/// Lower ordinals map to a higher CRF and a smaller bitrate ceiling.
pub fn quality_preset(codec: Codec, quality: QualityLevel) -> QualityPreset {
    let bitrate_multiplier = match quality.ordinal() {
        1 => 0.6,
        2 => 0.8,
        3 => 1.0,
        4 => 1.25,
        _ => 1.5,
    };
    let crf = match (codec, quality.ordinal()) {
        (Codec::H264, 1) => 28,
        (Codec::H264, 2) => 25,
        (Codec::H264, 3) => 23,
        (Codec::H264, 4) => 21,
        (Codec::H264, _) => 19,
        (Codec::Av1, 1) => 40,
        (Codec::Av1, 2) => 36,
        (Codec::Av1, 3) => 32,
        (Codec::Av1, 4) => 28,
        (Codec::Av1, _) => 24,
    };
    QualityPreset {
        crf,
        bitrate_multiplier,
    }
}

/// Codec profile and level pair, e.g. `high` / `4.1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileLevel {
    pub profile: &'static str,
    pub level: &'static str,
}

/// Profile/level selected from the rendition height
pub fn profile_level(codec: Codec, height: u32) -> ProfileLevel {
    let (profile, level) = match codec {
        Codec::H264 => match height {
            0..=360 => ("main", "3.0"),
            361..=480 => ("main", "3.1"),
            481..=720 => ("high", "3.1"),
            721..=1080 => ("high", "4.1"),
            1081..=1440 => ("high", "5.0"),
            _ => ("high", "5.1"),
        },
        Codec::Av1 => match height {
            0..=480 => ("main", "3.0"),
            481..=720 => ("main", "3.1"),
            721..=1080 => ("main", "4.0"),
            1081..=1440 => ("main", "5.0"),
            _ => ("main", "5.1"),
        },
    };
    ProfileLevel { profile, level }
}

/// RFC 6381 codec string for the video track, e.g. `avc1.640029`
pub fn video_codec_string(codec: Codec, profile: &str, level: &str) -> String {
    match codec {
        Codec::H264 => {
            let (profile_idc, constraints) = match profile {
                "baseline" => (0x42, 0xE0),
                "main" => (0x4D, 0x40),
                _ => (0x64, 0x00),
            };
            let level_idc = parse_level(level).map(|l| (l * 10.0).round() as u32).unwrap_or(41);
            format!("avc1.{:02x}{:02x}{:02x}", profile_idc, constraints, level_idc)
        }
        Codec::Av1 => {
            // seq_level_idx = (major - 2) * 4 + minor
            let seq_level_idx = parse_level(level)
                .map(|l| {
                    let major = l.trunc() as u32;
                    let minor = ((l - l.trunc()) * 10.0).round() as u32;
                    major.saturating_sub(2) * 4 + minor
                })
                .unwrap_or(8);
            format!("av01.0.{:02}M.08", seq_level_idx)
        }
    }
}

/// Codec string for the AAC-LC audio track
pub const AUDIO_CODEC_STRING: &str = "mp4a.40.2";

fn parse_level(level: &str) -> Option<f64> {
    level.parse::<f64>().ok()
}

/// Audio bitrate (kbps) for a rendition height
pub fn audio_bitrate_kbps(height: u32) -> u32 {
    if height >= AUDIO_UPGRADE_MIN_HEIGHT {
        AUDIO_UPGRADE_BITRATE_KBPS
    } else {
        AUDIO_BITRATE_KBPS
    }
}

/// Keyframe placement for segment-aligned GOPs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopPolicy {
    /// Frames between keyframes
    pub keyint: u32,
    /// Minimum frames between keyframes
    pub keyint_min: u32,
    /// Whether scene-cut keyframes are suppressed
    pub disable_scenecut: bool,
}

/// Keyframe interval is one segment worth of frames so every segment starts
/// on an IDR frame.
///
/// Scene-cut detection is disabled only for H.264. AV1 keeps the encoder's
/// own scene detection until a product decision says otherwise.
pub fn gop_policy(codec: Codec, fps: f64, segment_duration_secs: u32) -> GopPolicy {
    let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
    let keyint = ((fps * segment_duration_secs as f64).round() as u32).max(1);
    match codec {
        Codec::H264 => GopPolicy {
            keyint,
            keyint_min: keyint,
            disable_scenecut: true,
        },
        Codec::Av1 => GopPolicy {
            keyint,
            keyint_min: 1,
            disable_scenecut: false,
        },
    }
}
