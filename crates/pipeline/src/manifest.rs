//! HLS master playlist generation.

use crate::metadata::RenditionMetadata;
use crate::presets::{audio_bitrate_kbps, video_codec_string, Codec, AUDIO_CODEC_STRING};
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const HLS_VERSION: u32 = 7;

/// Share of peak bandwidth reported as AVERAGE-BANDWIDTH
const AVERAGE_BANDWIDTH_RATIO: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to write master playlist: {0}")]
    Io(#[from] std::io::Error),
}

/// One `#EXT-X-STREAM-INF` entry before rendering
#[derive(Debug, Clone, PartialEq)]
pub struct VariantStream {
    /// Peak bits per second, video plus audio
    pub bandwidth: u64,
    pub average_bandwidth: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub codecs: String,
    pub uri: String,
}

/// Build variant entries for one codec family, sorted by ascending bandwidth.
///
/// Measured bitrates win over planned ceilings. Audio is only counted when the
/// source has an audio track.
pub fn variant_streams(
    renditions: &[RenditionMetadata],
    codec: Codec,
    has_audio: bool,
) -> Vec<VariantStream> {
    let mut variants: Vec<VariantStream> = renditions
        .iter()
        .filter(|r| r.codec == codec)
        .map(|r| {
            let audio_kbps = if has_audio {
                audio_bitrate_kbps(r.height)
            } else {
                0
            };
            let bandwidth = (r.effective_bitrate_kbps() as u64 + audio_kbps as u64) * 1000;
            let video_codec = video_codec_string(r.codec, &r.profile, &r.level);
            let codecs = if has_audio {
                format!("{},{}", video_codec, AUDIO_CODEC_STRING)
            } else {
                video_codec
            };

            VariantStream {
                bandwidth,
                average_bandwidth: (bandwidth as f64 * AVERAGE_BANDWIDTH_RATIO).round() as u64,
                width: r.width,
                height: r.height,
                frame_rate: r.frame_rate,
                codecs,
                uri: r.playlist_path.clone(),
            }
        })
        .collect();

    variants.sort_by(|a, b| {
        a.bandwidth
            .cmp(&b.bandwidth)
            .then(a.height.cmp(&b.height))
    });
    variants
}

/// Render the master playlist text
pub fn generate_master_playlist(
    renditions: &[RenditionMetadata],
    codec: Codec,
    has_audio: bool,
) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    let _ = writeln!(out, "#EXT-X-VERSION:{}", HLS_VERSION);
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");

    for v in variant_streams(renditions, codec, has_audio) {
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},AVERAGE-BANDWIDTH={},RESOLUTION={}x{},FRAME-RATE={:.3},CODECS=\"{}\"",
            v.bandwidth, v.average_bandwidth, v.width, v.height, v.frame_rate, v.codecs
        );
        let _ = writeln!(out, "{}", v.uri);
    }
    out
}

/// Write `master.m3u8` into the job root
pub async fn write_master_playlist(job_root: &Path, playlist: &str) -> Result<(), ManifestError> {
    tokio::fs::write(job_root.join(MASTER_PLAYLIST), playlist).await?;
    Ok(())
}
