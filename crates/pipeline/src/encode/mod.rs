//! Encoder invocations for hls-forge

pub mod ffmpeg;

pub use ffmpeg::{
    build_audio_extract_invocation, build_rendition_invocation, build_storyboard_invocation,
    build_thumbnail_invocation, build_transcribe_invocation, parse_segment_opened,
    parse_timestamp, plan_storyboard, run_encoder, run_tool, thumbnail_timestamp, EncodeError,
    EncodeOutcome, ProgressParser, RenditionEncodeParams, SegmentOpened, StoryboardLayout,
};
