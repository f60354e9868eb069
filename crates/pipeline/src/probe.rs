//! Source probing.
//!
//! Builds the ffprobe invocation and parses its JSON output into the source
//! properties the rest of the pipeline needs (duration, resolution, frame
//! rate, codecs, audio layout).

use crate::supervisor::{Invocation, SpawnError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be started.
    #[error("Failed to start prober: {0}")]
    Spawn(#[from] SpawnError),

    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Source has no usable video stream.
    #[error("No video stream found")]
    NoVideoStream,

    /// Duration missing or not positive.
    #[error("Invalid duration: {0}")]
    InvalidDuration(f64),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container-level properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    /// File size in bytes.
    pub size: u64,
    /// Overall bitrate in kbps (0 when unknown).
    pub bitrate: u32,
    /// Container format name (e.g. "mov,mp4,m4a,3gp,3g2,mj2").
    pub format_name: String,
}

/// Primary video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoStream {
    /// Codec name (e.g. "h264", "hevc").
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second.
    pub fps: f64,
    /// Bitrate in kbps (if reported).
    pub bitrate: Option<u32>,
    pub pix_fmt: Option<String>,
}

/// Primary audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioStream {
    /// Codec name (e.g. "aac", "opus").
    pub codec: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
    /// Bitrate in kbps (if reported).
    pub bitrate: Option<u32>,
}

/// Everything the pipeline knows about the source after probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Duration in seconds.
    pub duration: f64,
    pub container: ContainerInfo,
    pub video: VideoStream,
    pub audio: Option<AudioStream>,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
        pub sample_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub pix_fmt: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
        pub format_name: Option<String>,
    }
}

/// Builds `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
pub fn build_probe_invocation(prober: &Path, input: &Path) -> Invocation {
    Invocation::new(prober)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(input)
}

/// Parses ffprobe JSON output into a SourceInfo.
///
/// The first video stream and the first audio stream are used. Duration comes
/// from the container, falling back to the video stream.
pub fn parse_ffprobe_output(json_str: &str) -> Result<SourceInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video_raw = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    let width = video_raw.width.unwrap_or(0);
    let height = video_raw.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(ProbeError::NoVideoStream);
    }

    let fps = video_raw
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video_raw.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(30.0);

    let video = VideoStream {
        codec: video_raw.codec_name.clone().unwrap_or_default(),
        width,
        height,
        fps,
        bitrate: video_raw.bit_rate.as_deref().and_then(parse_kbps),
        pix_fmt: video_raw.pix_fmt.clone(),
    };

    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|a| AudioStream {
            codec: a.codec_name.clone().unwrap_or_default(),
            channels: a.channels.unwrap_or(0),
            sample_rate: a.sample_rate.as_deref().and_then(|r| r.parse().ok()),
            bitrate: a.bit_rate.as_deref().and_then(parse_kbps),
        });

    let duration = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| video_raw.duration.as_deref().and_then(|d| d.parse().ok()))
        .unwrap_or(0.0);

    if !(duration.is_finite() && duration > 0.0) {
        return Err(ProbeError::InvalidDuration(duration));
    }

    let size = format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(SourceInfo {
        duration,
        container: ContainerInfo {
            size,
            bitrate: format.bit_rate.as_deref().and_then(parse_kbps).unwrap_or(0),
            format_name: format.format_name.unwrap_or_default(),
        },
        video,
        audio,
    })
}

/// Parses `30000/1001` or `25` style rates. `0/0` yields None.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn parse_kbps(bps: &str) -> Option<u32> {
    bps.parse::<f64>()
        .ok()
        .filter(|v| *v > 0.0)
        .map(|v| (v / 1000.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "avg_frame_rate": "30000/1001",
                "r_frame_rate": "30000/1001",
                "pix_fmt": "yuv420p",
                "bit_rate": "8000000"
            },
            {
                "codec_type": "audio",
                "codec_name": "aac",
                "channels": 2,
                "sample_rate": "48000",
                "bit_rate": "192000"
            }
        ],
        "format": {
            "duration": "120.500000",
            "size": "130000000",
            "bit_rate": "8630000",
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2"
        }
    }"#;

    #[test]
    fn test_parse_full_probe_output() {
        let info = parse_ffprobe_output(SAMPLE).unwrap();

        assert!((info.duration - 120.5).abs() < 1e-9);
        assert_eq!(info.container.size, 130_000_000);
        assert_eq!(info.container.bitrate, 8630);
        assert_eq!(info.video.codec, "h264");
        assert_eq!((info.video.width, info.video.height), (1920, 1080));
        assert!((info.video.fps - 29.97).abs() < 0.01);
        assert_eq!(info.video.bitrate, Some(8000));
        assert_eq!(info.video.pix_fmt.as_deref(), Some("yuv420p"));

        let audio = info.audio.unwrap();
        assert_eq!(audio.codec, "aac");
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, Some(48000));
        assert_eq!(audio.bitrate, Some(192));
    }

    #[test]
    fn test_audio_only_source_is_rejected() {
        let json = r#"{
            "streams": [{"codec_type": "audio", "codec_name": "mp3", "channels": 2}],
            "format": {"duration": "60.0", "size": "1000"}
        }"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::NoVideoStream)
        ));
    }

    #[test]
    fn test_missing_duration_is_rejected() {
        let json = r#"{
            "streams": [{"codec_type": "video", "codec_name": "h264", "width": 640, "height": 360}],
            "format": {"size": "1000"}
        }"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_stream_duration_fallback_and_silent_source() {
        let json = r#"{
            "streams": [{
                "codec_type": "video", "codec_name": "vp9", "width": 640, "height": 360,
                "avg_frame_rate": "0/0", "r_frame_rate": "25/1", "duration": "10.0"
            }],
            "format": {"size": "1000"}
        }"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert!((info.duration - 10.0).abs() < 1e-9);
        assert!((info.video.fps - 25.0).abs() < 1e-9);
        assert!(info.audio.is_none());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
        assert!(matches!(
            parse_ffprobe_output(r#"{"streams": []}"#),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_probe_invocation_arguments() {
        let inv = build_probe_invocation(Path::new("/usr/bin/ffprobe"), Path::new("/in/a.mp4"));
        let args = inv.args_lossy();
        assert_eq!(inv.program(), Path::new("/usr/bin/ffprobe"));
        assert_eq!(args.last().map(String::as_str), Some("/in/a.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-print_format" && w[1] == "json"));
        assert!(args.contains(&"-show_streams".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_frame_rate_rational(num in 1u32..240_000, den in 1u32..10_000) {
            let parsed = parse_frame_rate(&format!("{}/{}", num, den)).unwrap();
            prop_assert!((parsed - num as f64 / den as f64).abs() < 1e-9);
        }

        #[test]
        fn prop_zero_denominator_rejected(num in 0u32..1000) {
            let raw = format!("{}/0", num);
            prop_assert!(parse_frame_rate(&raw).is_none());
        }
    }
}
