//! ffmpeg invocation builders and output parsing.
//!
//! Builds the argument vectors for rendition encodes, the hero thumbnail,
//! the storyboard sprite and audio extraction for captions, and runs them
//! through the supervisor while turning `-progress pipe:1` output into a
//! fractional progress stream and `Opening '...m4s'` log lines into
//! segment-ready notifications.

use crate::ladder::RenditionPlan;
use crate::presets::{gop_policy, Codec};
use crate::supervisor::{Invocation, ProcessLabel, ProcessSupervisor, SpawnError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Segment file name template inside a rendition directory
pub const SEGMENT_TEMPLATE: &str = "segment_%04d.m4s";
/// fMP4 init segment name
pub const INIT_SEGMENT: &str = "init.mp4";
/// Rendition playlist name
pub const PLAYLIST_NAME: &str = "playlist.m3u8";
/// Hero thumbnail file name
pub const THUMBNAIL_NAME: &str = "thumbnail_2160.jpg";
/// Maximum hero thumbnail height
pub const THUMBNAIL_MAX_HEIGHT: u32 = 2160;
/// Storyboard sprite file name
pub const STORYBOARD_NAME: &str = "storyboard.jpg";

const STORYBOARD_MAX_TILES: u32 = 100;
const STORYBOARD_COLUMNS: u32 = 10;
const STORYBOARD_TILE_WIDTH: u32 = 160;

/// Stderr lines kept for error reporting
const STDERR_TAIL_LINES: usize = 20;

/// Error type for encoder invocations
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Failed to start encoder: {0}")]
    Spawn(#[from] SpawnError),

    /// Encoder exited with non-zero status
    #[error("Encoder failed with exit code {code}: {stderr_tail}")]
    EncoderFailed { code: i32, stderr_tail: String },

    /// Encoder was terminated by a signal
    #[error("Encoder process was terminated by signal")]
    EncoderTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inputs for one rendition encode
#[derive(Debug, Clone)]
pub struct RenditionEncodeParams<'a> {
    pub input: &'a Path,
    /// Absolute rendition directory
    pub output_dir: &'a Path,
    pub rendition: &'a RenditionPlan,
    pub fps: f64,
    pub segment_duration_secs: u32,
    pub has_audio: bool,
    pub job_id: &'a str,
}

/// Build the ffmpeg invocation that encodes and packages one rendition as
/// fMP4 HLS.
pub fn build_rendition_invocation(encoder: &Path, params: &RenditionEncodeParams) -> Invocation {
    let r = params.rendition;
    let gop = gop_policy(r.codec, params.fps, params.segment_duration_secs);

    let mut inv = Invocation::new(encoder)
        .args(["-hide_banner", "-y", "-loglevel", "info"])
        .arg("-i")
        .arg(params.input)
        .args(["-map", "0:v:0"]);
    if params.has_audio {
        inv = inv.args(["-map", "0:a:0"]);
    }

    inv = inv
        .arg("-vf")
        .arg(format!("scale={}:{}", r.width, r.height))
        .args(["-pix_fmt", "yuv420p"]);

    inv = match r.codec {
        Codec::H264 => h264_args(inv, r),
        Codec::Av1 => av1_args(inv, r),
    };

    inv = inv
        .arg("-maxrate")
        .arg(format!("{}k", r.max_bitrate_kbps))
        .arg("-bufsize")
        .arg(format!("{}k", r.buffer_size_kbps))
        .arg("-g")
        .arg(gop.keyint.to_string())
        .arg("-keyint_min")
        .arg(gop.keyint_min.to_string());
    if gop.disable_scenecut {
        inv = inv.args(["-sc_threshold", "0"]);
    }

    if params.has_audio {
        inv = inv
            .args(["-c:a", "aac"])
            .arg("-b:a")
            .arg(format!("{}k", r.audio_bitrate_kbps))
            .args(["-ac", "2"]);
    }

    inv.arg("-metadata")
        .arg(format!("comment={}", ProcessSupervisor::job_tag(params.job_id)))
        .args(["-f", "hls"])
        .arg("-hls_time")
        .arg(params.segment_duration_secs.to_string())
        .args(["-hls_playlist_type", "vod"])
        .args(["-hls_segment_type", "fmp4"])
        .args(["-hls_fmp4_init_filename", INIT_SEGMENT])
        .args(["-hls_flags", "independent_segments"])
        .arg("-hls_segment_filename")
        .arg(params.output_dir.join(SEGMENT_TEMPLATE))
        .args(["-progress", "pipe:1", "-nostats"])
        .arg(params.output_dir.join(PLAYLIST_NAME))
}

fn h264_args(inv: Invocation, r: &RenditionPlan) -> Invocation {
    inv.args(["-c:v", Codec::H264.encoder_library()])
        .args(["-preset", Codec::H264.speed_preset()])
        .arg("-crf")
        .arg(r.crf.to_string())
        .arg("-profile:v")
        .arg(&r.profile)
        .arg("-level:v")
        .arg(&r.level)
}

fn av1_args(inv: Invocation, r: &RenditionPlan) -> Invocation {
    inv.args(["-c:v", Codec::Av1.encoder_library()])
        .args(["-preset", Codec::Av1.speed_preset()])
        .arg("-crf")
        .arg(r.crf.to_string())
}

/// Timestamp for the hero thumbnail: 10% into the source, capped at 30s
pub fn thumbnail_timestamp(duration_secs: f64) -> f64 {
    (duration_secs * 0.1).clamp(0.0, 30.0)
}

/// Single-frame JPEG at up to 2160 lines
pub fn build_thumbnail_invocation(
    encoder: &Path,
    input: &Path,
    output: &Path,
    duration_secs: f64,
    job_id: &str,
) -> Invocation {
    Invocation::new(encoder)
        .args(["-hide_banner", "-y", "-loglevel", "error"])
        .arg("-ss")
        .arg(format!("{:.3}", thumbnail_timestamp(duration_secs)))
        .arg("-i")
        .arg(input)
        .args(["-frames:v", "1"])
        .arg("-vf")
        .arg(format!("scale=-2:'min({},ih)'", THUMBNAIL_MAX_HEIGHT))
        .args(["-q:v", "2"])
        .arg("-metadata")
        .arg(format!("comment={}", ProcessSupervisor::job_tag(job_id)))
        .arg(output)
}

/// Geometry of the storyboard sprite; also written as storyboard.json
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryboardLayout {
    /// Seconds between tiles
    pub interval: u32,
    pub columns: u32,
    pub rows: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Number of populated tiles
    pub count: u32,
}

/// Pick tile interval and grid so the sprite holds at most 100 tiles
pub fn plan_storyboard(duration_secs: f64, source_width: u32, source_height: u32) -> StoryboardLayout {
    let duration = duration_secs.max(1.0).ceil() as u32;
    let interval = duration.div_ceil(STORYBOARD_MAX_TILES).max(1);
    let count = duration.div_ceil(interval).clamp(1, STORYBOARD_MAX_TILES);
    let columns = count.min(STORYBOARD_COLUMNS);
    let rows = count.div_ceil(columns);

    let tile_height = if source_width > 0 {
        ((STORYBOARD_TILE_WIDTH as u64 * source_height as u64 / source_width as u64) as u32 & !1)
            .max(2)
    } else {
        90
    };

    StoryboardLayout {
        interval,
        columns,
        rows,
        tile_width: STORYBOARD_TILE_WIDTH,
        tile_height,
        count,
    }
}

pub fn build_storyboard_invocation(
    encoder: &Path,
    input: &Path,
    output: &Path,
    layout: &StoryboardLayout,
    job_id: &str,
) -> Invocation {
    Invocation::new(encoder)
        .args(["-hide_banner", "-y", "-loglevel", "error"])
        .arg("-i")
        .arg(input)
        .arg("-vf")
        .arg(format!(
            "fps=1/{},scale={}:{},tile={}x{}",
            layout.interval, layout.tile_width, layout.tile_height, layout.columns, layout.rows
        ))
        .args(["-frames:v", "1", "-q:v", "4"])
        .arg("-metadata")
        .arg(format!("comment={}", ProcessSupervisor::job_tag(job_id)))
        .arg(output)
}

/// 16 kHz mono PCM for the transcriber
pub fn build_audio_extract_invocation(
    encoder: &Path,
    input: &Path,
    output: &Path,
    job_id: &str,
) -> Invocation {
    Invocation::new(encoder)
        .args(["-hide_banner", "-y", "-loglevel", "error"])
        .arg("-i")
        .arg(input)
        .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
        .arg("-metadata")
        .arg(format!("comment={}", ProcessSupervisor::job_tag(job_id)))
        .arg(output)
}

/// whisper.cpp style transcriber writing `<output_stem>.vtt`
pub fn build_transcribe_invocation(
    transcriber: &Path,
    model: Option<&Path>,
    audio: &Path,
    output_stem: &Path,
) -> Invocation {
    let mut inv = Invocation::new(transcriber);
    if let Some(model) = model {
        inv = inv.arg("-m").arg(model);
    }
    inv.arg("-f")
        .arg(audio)
        .arg("-ovtt")
        .arg("-of")
        .arg(output_stem)
}

/// Incremental parser for `-progress` key=value output
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_us: f64,
    last: f64,
}

impl ProgressParser {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_us: (duration_secs * 1_000_000.0).max(0.0),
            last: 0.0,
        }
    }

    /// Feed one line; returns a new fraction when the line moved progress
    pub fn feed_line(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        let fraction = match key.trim() {
            // ffmpeg reports out_time_ms in microseconds as well
            "out_time_us" | "out_time_ms" => {
                let us = value.trim().parse::<f64>().ok()?;
                self.fraction_of(us)?
            }
            "out_time" => {
                let us = parse_timestamp(value.trim())? * 1_000_000.0;
                self.fraction_of(us)?
            }
            "progress" if value.trim() == "end" => 1.0,
            _ => return None,
        };

        if fraction > self.last {
            self.last = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    fn fraction_of(&self, us: f64) -> Option<f64> {
        if self.duration_us <= 0.0 || !us.is_finite() || us < 0.0 {
            return None;
        }
        Some((us / self.duration_us).min(1.0))
    }
}

/// Parses `HH:MM:SS.ffffff` into seconds
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let mut parts = raw.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + s)
}

/// A media segment ffmpeg started writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOpened {
    pub path: PathBuf,
    pub index: Option<u32>,
}

/// Recognise `Opening '<path>.m4s' for writing` in encoder logs
pub fn parse_segment_opened(line: &str) -> Option<SegmentOpened> {
    let start = line.find("Opening '")? + "Opening '".len();
    let rest = &line[start..];
    let end = rest.find("' for writing")?;
    let path = &rest[..end];
    if !path.ends_with(".m4s") {
        return None;
    }

    let path = PathBuf::from(path);
    let index = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.rsplit('_').next())
        .and_then(|n| n.parse().ok());
    Some(SegmentOpened { path, index })
}

/// Result of a finished rendition encode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// Segments reported ready
    pub segments: u32,
}

/// Run a rendition encode, streaming progress and segment notifications.
///
/// A segment is reported ready once the encoder opens the next one, and the
/// final segment once the process exits successfully.
pub async fn run_encoder<P, S>(
    supervisor: &Arc<ProcessSupervisor>,
    job_id: &str,
    invocation: &Invocation,
    duration_secs: f64,
    mut on_progress: P,
    mut on_segment: S,
) -> Result<EncodeOutcome, EncodeError>
where
    P: FnMut(f64) + Send,
    S: FnMut(&SegmentOpened) + Send,
{
    let mut child = supervisor
        .spawn(job_id, ProcessLabel::Encode, invocation)
        .await?;

    let stdout = child.take_stdout();
    let stderr = child.take_stderr();
    let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

    let mut parser = ProgressParser::new(duration_secs);
    let mut pending_segment: Option<SegmentOpened> = None;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut outcome = EncodeOutcome::default();

    loop {
        tokio::select! {
            line = next_line(&mut out_lines), if out_lines.is_some() => match line {
                Some(line) => {
                    if let Some(fraction) = parser.feed_line(&line) {
                        on_progress(fraction);
                    }
                }
                None => out_lines = None,
            },
            line = next_line(&mut err_lines), if err_lines.is_some() => match line {
                Some(line) => {
                    if let Some(opened) = parse_segment_opened(&line) {
                        if let Some(done) = pending_segment.replace(opened) {
                            outcome.segments += 1;
                            on_segment(&done);
                        }
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => err_lines = None,
            },
            else => break,
        }
    }

    let status = child.wait().await?;
    check_status(status, &tail)?;

    if let Some(done) = pending_segment.take() {
        outcome.segments += 1;
        on_segment(&done);
    }
    on_progress(1.0);
    debug!(job_id, segments = outcome.segments, "Encoder finished");
    Ok(outcome)
}

/// Run a short-lived tool (thumbnail, storyboard, audio extraction, transcriber)
pub async fn run_tool(
    supervisor: &Arc<ProcessSupervisor>,
    job_id: &str,
    label: ProcessLabel,
    invocation: &Invocation,
) -> Result<(), EncodeError> {
    let output = supervisor
        .run_to_completion(job_id, label, invocation)
        .await?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: VecDeque<String> = stderr
        .lines()
        .rev()
        .take(STDERR_TAIL_LINES)
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    check_status(output.status, &tail)
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn check_status(status: ExitStatus, tail: &VecDeque<String>) -> Result<(), EncodeError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(EncodeError::EncoderFailed {
            code,
            stderr_tail: tail.iter().cloned().collect::<Vec<_>>().join("\n"),
        }),
        None => Err(EncodeError::EncoderTerminated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::{plan_ladder, Rung, SourceDimensions};
    use crate::presets::QualityLevel;
    use proptest::prelude::*;

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn plan_for(codec: Codec, height: u32) -> RenditionPlan {
        let source = SourceDimensions {
            width: 1920,
            height: 1080,
            fps: 30.0,
        };
        let rung = Rung {
            target_height: height,
            quality: QualityLevel::clamped(3),
            enabled: true,
        };
        plan_ladder(source, &[rung], codec).unwrap().renditions.remove(0)
    }

    fn rendition_args(codec: Codec, has_audio: bool) -> Vec<String> {
        let rendition = plan_for(codec, 720);
        let params = RenditionEncodeParams {
            input: Path::new("/in/source.mov"),
            output_dir: Path::new("/out/job-1/renditions/h264/720p"),
            rendition: &rendition,
            fps: 30.0,
            segment_duration_secs: 6,
            has_audio,
            job_id: "job-1",
        };
        build_rendition_invocation(Path::new("ffmpeg"), &params).args_lossy()
    }

    #[test]
    fn test_h264_rendition_arguments() {
        let args = rendition_args(Codec::H264, true);

        assert!(has_flag_with_value(&args, "-i", "/in/source.mov"));
        assert!(has_flag_with_value(&args, "-vf", "scale=1280:720"));
        assert!(has_flag_with_value(&args, "-c:v", "libx264"));
        assert!(has_flag_with_value(&args, "-crf", "23"));
        assert!(has_flag_with_value(&args, "-profile:v", "high"));
        assert!(has_flag_with_value(&args, "-level:v", "3.1"));
        assert!(has_flag_with_value(&args, "-g", "180"));
        assert!(has_flag_with_value(&args, "-keyint_min", "180"));
        assert!(has_flag_with_value(&args, "-sc_threshold", "0"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
        assert!(has_flag_with_value(&args, "-b:a", "128k"));
        assert!(has_flag_with_value(&args, "-hls_segment_type", "fmp4"));
        assert!(has_flag_with_value(&args, "-hls_fmp4_init_filename", "init.mp4"));
        assert!(has_flag_with_value(
            &args,
            "-hls_segment_filename",
            "/out/job-1/renditions/h264/720p/segment_%04d.m4s"
        ));
        assert!(has_flag_with_value(&args, "-metadata", "comment=hls-forge:job-1"));
        assert!(has_flag_with_value(&args, "-progress", "pipe:1"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("/out/job-1/renditions/h264/720p/playlist.m3u8")
        );
    }

    #[test]
    fn test_av1_rendition_keeps_scene_detection() {
        let args = rendition_args(Codec::Av1, false);

        assert!(has_flag_with_value(&args, "-c:v", "libsvtav1"));
        assert!(has_flag_with_value(&args, "-keyint_min", "1"));
        assert!(!has_flag(&args, "-sc_threshold"));
        assert!(!has_flag(&args, "-c:a"));
        assert!(!has_flag_with_value(&args, "-map", "0:a:0"));
    }

    #[test]
    fn test_progress_parser_handles_all_time_keys() {
        let mut parser = ProgressParser::new(10.0);

        assert_eq!(parser.feed_line("frame=10"), None);
        assert_eq!(parser.feed_line("out_time_us=2500000"), Some(0.25));
        assert_eq!(parser.feed_line("out_time_ms=5000000"), Some(0.5));
        assert_eq!(parser.feed_line("out_time=00:00:07.500000"), Some(0.75));
        // stale values do not move progress backwards
        assert_eq!(parser.feed_line("out_time_us=1000000"), None);
        assert_eq!(parser.feed_line("out_time_us=N/A"), None);
        assert_eq!(parser.feed_line("progress=continue"), None);
        assert_eq!(parser.feed_line("progress=end"), Some(1.0));
    }

    #[test]
    fn test_progress_parser_zero_duration_only_reports_end() {
        let mut parser = ProgressParser::new(0.0);
        assert_eq!(parser.feed_line("out_time_us=1000"), None);
        assert_eq!(parser.feed_line("progress=end"), Some(1.0));
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("01:02:03.5"), Some(3723.5));
        assert_eq!(parse_timestamp("00:00:00.000000"), Some(0.0));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
    }

    #[test]
    fn test_segment_log_parsing() {
        let line = "[hls @ 0x5581] Opening '/out/j/renditions/h264/720p/segment_0003.m4s' for writing";
        let opened = parse_segment_opened(line).unwrap();
        assert_eq!(
            opened.path,
            PathBuf::from("/out/j/renditions/h264/720p/segment_0003.m4s")
        );
        assert_eq!(opened.index, Some(3));

        assert!(parse_segment_opened(
            "[hls @ 0x5581] Opening '/out/j/720p/playlist.m3u8.tmp' for writing"
        )
        .is_none());
        assert!(parse_segment_opened("[hls @ 0x5581] Opening '/out/j/720p/init.mp4' for writing")
            .is_none());
        assert!(parse_segment_opened("frame=  100 fps= 50").is_none());
    }

    #[test]
    fn test_storyboard_layout() {
        let short = plan_storyboard(30.0, 1920, 1080);
        assert_eq!(short.interval, 1);
        assert_eq!(short.count, 30);
        assert_eq!((short.columns, short.rows), (10, 3));
        assert_eq!((short.tile_width, short.tile_height), (160, 90));

        let long = plan_storyboard(3600.0, 1920, 1080);
        assert_eq!(long.interval, 36);
        assert_eq!(long.count, 100);
        assert_eq!((long.columns, long.rows), (10, 10));

        let tiny = plan_storyboard(0.4, 1080, 1920);
        assert_eq!(tiny.count, 1);
        assert_eq!((tiny.columns, tiny.rows), (1, 1));
        assert_eq!(tiny.tile_height, 284);
    }

    #[test]
    fn test_side_tool_invocations_carry_job_tag() {
        let tag = "comment=hls-forge:job-9";
        let thumb = build_thumbnail_invocation(
            Path::new("ffmpeg"),
            Path::new("in.mp4"),
            Path::new("t.jpg"),
            120.0,
            "job-9",
        )
        .args_lossy();
        assert!(has_flag_with_value(&thumb, "-ss", "12.000"));
        assert!(has_flag_with_value(&thumb, "-metadata", tag));

        let layout = plan_storyboard(60.0, 1280, 720);
        let board = build_storyboard_invocation(
            Path::new("ffmpeg"),
            Path::new("in.mp4"),
            Path::new("s.jpg"),
            &layout,
            "job-9",
        )
        .args_lossy();
        assert!(has_flag_with_value(&board, "-vf", "fps=1/1,scale=160:90,tile=10x6"));

        let audio = build_audio_extract_invocation(
            Path::new("ffmpeg"),
            Path::new("in.mp4"),
            Path::new("a.wav"),
            "job-9",
        )
        .args_lossy();
        assert!(has_flag_with_value(&audio, "-ar", "16000"));
        assert!(has_flag_with_value(&audio, "-metadata", tag));
    }

    #[test]
    fn test_transcribe_invocation() {
        let with_model = build_transcribe_invocation(
            Path::new("whisper-cli"),
            Some(Path::new("/models/base.bin")),
            Path::new("/tmp/a.wav"),
            Path::new("/out/captions/captions"),
        )
        .args_lossy();
        assert!(has_flag_with_value(&with_model, "-m", "/models/base.bin"));
        assert!(has_flag_with_value(&with_model, "-of", "/out/captions/captions"));
        assert!(has_flag(&with_model, "-ovtt"));

        let without = build_transcribe_invocation(
            Path::new("whisper-cli"),
            None,
            Path::new("/tmp/a.wav"),
            Path::new("/out/c"),
        )
        .args_lossy();
        assert!(!has_flag(&without, "-m"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_fraction_bounded_and_monotonic(
            duration in 1.0f64..10_000.0,
            times in prop::collection::vec(0u64..20_000_000_000, 1..40),
        ) {
            let mut parser = ProgressParser::new(duration);
            let mut last = 0.0;
            for t in times {
                if let Some(f) = parser.feed_line(&format!("out_time_us={}", t)) {
                    prop_assert!(f > last);
                    prop_assert!(f <= 1.0);
                    last = f;
                }
            }
        }

        #[test]
        fn prop_storyboard_grid_holds_all_tiles(duration in 0.0f64..100_000.0) {
            let layout = plan_storyboard(duration, 1920, 1080);
            prop_assert!(layout.count >= 1 && layout.count <= 100);
            prop_assert!(layout.columns * layout.rows >= layout.count);
            prop_assert!(layout.interval as u64 * layout.count as u64 >= duration.floor() as u64);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_reports_exit_code() {
        use crate::supervisor::{SupervisorSettings, SysinfoProcessTable};

        let sup = Arc::new(ProcessSupervisor::new(
            Arc::new(SysinfoProcessTable::new()),
            SupervisorSettings::default(),
        ));
        let ok = run_tool(&sup, "job-t", ProcessLabel::Thumbnail, &Invocation::new("true")).await;
        assert!(ok.is_ok());

        let err = run_tool(&sup, "job-t", ProcessLabel::Thumbnail, &Invocation::new("false"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::EncoderFailed { code: 1, .. }));
        assert!(sup.registered_pids("job-t").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_encoder_streams_progress_and_segments() {
        use crate::supervisor::{SupervisorSettings, SysinfoProcessTable};
        use parking_lot::Mutex;

        let sup = Arc::new(ProcessSupervisor::new(
            Arc::new(SysinfoProcessTable::new()),
            SupervisorSettings::default(),
        ));
        let script = "printf 'out_time_us=5000000\\nprogress=continue\\n'; \
                      echo \"Opening '/o/segment_0000.m4s' for writing\" >&2; \
                      echo \"Opening '/o/segment_0001.m4s' for writing\" >&2; \
                      printf 'progress=end\\n'";
        let inv = Invocation::new("sh").arg("-c").arg(script);

        let fractions = Mutex::new(Vec::new());
        let segments = Mutex::new(Vec::new());
        let outcome = run_encoder(
            &sup,
            "job-e",
            &inv,
            10.0,
            |f| fractions.lock().push(f),
            |s| segments.lock().push(s.index),
        )
        .await
        .unwrap();

        assert_eq!(outcome.segments, 2);
        assert_eq!(*segments.lock(), vec![Some(0), Some(1)]);
        let fractions = fractions.lock();
        assert_eq!(fractions.first().copied(), Some(0.5));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }
}
