//! Startup checks module for hls-forge
//!
//! Provides preflight checks run once at service construction:
//! - Encoder (ffmpeg) availability and minimum version
//! - Prober (ffprobe) availability
//! - Encoder library for the configured codec (libx264 / libsvtav1)
//! - Optional transcriber presence (missing only disables captions)

use crate::config::Config;
use crate::presets::Codec;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest ffmpeg major version with fMP4 HLS output
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Prober not available: {0}")]
    ProberUnavailable(String),

    #[error("Encoder version requirement not met: {0}")]
    EncoderVersion(String),

    #[error("Encoder library {library} not available in {encoder}")]
    MissingEncoderLibrary { encoder: String, library: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse an ffmpeg-family version banner and extract the major version
///
/// Handles various version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
/// - ffprobe banners: "ffprobe version 6.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let lower = version_output.to_lowercase();
    let version_part = lower
        .lines()
        .find_map(|line| {
            line.split_once("ffmpeg version")
                .or_else(|| line.split_once("ffprobe version"))
                .map(|(_, rest)| rest)
        })?
        .split_whitespace()
        .next()?;

    // Handle n-prefixed versions (e.g., "n6.1-...")
    let version_str = version_part.trim_start_matches('n');

    // Extract major version (before first '.' or '-')
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

fn run_version(binary: &Path) -> Result<String, String> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| format!("{} -version failed: {}", binary.display(), e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", binary.display(), output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that the encoder runs and is new enough; returns its major version
pub fn check_encoder(encoder: &Path) -> Result<u32, InitializationError> {
    let banner = run_version(encoder).map_err(InitializationError::EncoderUnavailable)?;
    let major = parse_ffmpeg_version(&banner).ok_or_else(|| {
        InitializationError::EncoderVersion(format!(
            "Could not parse version from output: {}",
            banner.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(InitializationError::EncoderVersion(format!(
            "ffmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }
    Ok(major)
}

/// Check that the prober runs
pub fn check_prober(prober: &Path) -> Result<(), InitializationError> {
    run_version(prober)
        .map(|_| ())
        .map_err(InitializationError::ProberUnavailable)
}

/// Whether an `ffmpeg -encoders` listing contains a library
pub fn encoders_list_contains(listing: &str, library: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == library)
}

/// Check that the encoder was built with the library for `codec`
pub fn check_encoder_library(encoder: &Path, codec: Codec) -> Result<(), InitializationError> {
    let output = Command::new(encoder)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| InitializationError::EncoderUnavailable(e.to_string()))?;

    let listing = String::from_utf8_lossy(&output.stdout);
    if encoders_list_contains(&listing, codec.encoder_library()) {
        Ok(())
    } else {
        Err(InitializationError::MissingEncoderLibrary {
            encoder: encoder.display().to_string(),
            library: codec.encoder_library().to_string(),
        })
    }
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Encoder availability and version
/// 2. Prober availability
/// 3. Encoder library for the configured codec
/// 4. Transcriber presence (warning only)
pub fn run_startup_checks(cfg: &Config) -> Result<(), InitializationError> {
    let major = check_encoder(&cfg.binaries.encoder)?;
    check_prober(&cfg.binaries.prober)?;
    let codec = Codec::from(cfg.output.codec);
    check_encoder_library(&cfg.binaries.encoder, codec)?;

    if let Some(ref transcriber) = cfg.binaries.transcriber {
        if !transcriber.exists() {
            warn!(
                path = %transcriber.display(),
                "Transcriber not found; captions will be skipped"
            );
        }
    }

    info!(ffmpeg_major = major, codec = %codec, "Startup checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );

            let parsed = parse_ffmpeg_version(&version_output);
            prop_assert_eq!(
                parsed, Some(major),
                "Should parse major version {} from '{}'",
                major, version_output
            );
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );

            let parsed = parse_ffmpeg_version(&version_output);
            prop_assert_eq!(parsed, Some(major));
        }

        #[test]
        fn prop_ffprobe_banner_parsed(major in 1u32..20, minor in 0u32..10) {
            let version_output = format!(
                "ffprobe version {}.{} Copyright (c) 2007-2024\nbuilt with gcc 12.2.0",
                major, minor
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = r#"ffmpeg version n6.1-5-g1234567 Copyright (c) 2000-2024
built with gcc 12.2.0
configuration: --enable-gpl --enable-libx264"#;
        assert_eq!(parse_ffmpeg_version(output), Some(6));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version"), None);
    }

    #[test]
    fn test_encoders_listing() {
        let listing = r#"Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D libsvtav1            SVT-AV1(Scalable Video Technology for AV1) encoder (codec av1)
 A....D aac                  AAC (Advanced Audio Coding)"#;

        assert!(encoders_list_contains(listing, "libx264"));
        assert!(encoders_list_contains(listing, "libsvtav1"));
        assert!(!encoders_list_contains(listing, "libx265"));
        // description text does not count as a name
        assert!(!encoders_list_contains(listing, "H.264"));
    }

    #[test]
    fn test_missing_encoder_binary_is_initialization_error() {
        let result = check_encoder(Path::new("/nonexistent/hls-forge-test/ffmpeg"));
        assert!(matches!(
            result,
            Err(InitializationError::EncoderUnavailable(_))
        ));

        let result = check_prober(Path::new("/nonexistent/hls-forge-test/ffprobe"));
        assert!(matches!(
            result,
            Err(InitializationError::ProberUnavailable(_))
        ));
    }
}
