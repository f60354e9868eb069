//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// External binaries used by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinariesConfig {
    /// Encoder executable (ffmpeg)
    #[serde(default = "default_encoder")]
    pub encoder: PathBuf,
    /// Prober executable (ffprobe)
    #[serde(default = "default_prober")]
    pub prober: PathBuf,
    /// Optional speech-to-text executable producing WebVTT
    #[serde(default)]
    pub transcriber: Option<PathBuf>,
    /// Model file handed to the transcriber
    #[serde(default)]
    pub transcriber_model: Option<PathBuf>,
}

fn default_encoder() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_prober() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            encoder: default_encoder(),
            prober: default_prober(),
            transcriber: None,
            transcriber_model: None,
        }
    }
}

/// Scheduling limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    /// Number of logical cores (auto-detected if None)
    #[serde(default)]
    pub logical_cores: Option<u32>,
    /// Videos encoded at once (0 = auto-derive)
    #[serde(default)]
    pub max_parallel_jobs: u32,
    /// Encoder invocations per video (0 = auto-derive)
    #[serde(default)]
    pub renditions_per_job: u32,
    /// Job admissions per minute
    #[serde(default = "default_admissions_per_minute")]
    pub admissions_per_minute: u32,
}

fn default_admissions_per_minute() -> u32 {
    60
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            max_parallel_jobs: 0,
            renditions_per_job: 0,
            admissions_per_minute: default_admissions_per_minute(),
        }
    }
}

/// Video codec family for renditions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputCodec {
    #[default]
    H264,
    Av1,
}

/// Output layout settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Root under which `<job_id>/` output directories are created
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
    /// Root for per-job scratch directories
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// HLS segment duration in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,
    /// Codec used for every rendition
    #[serde(default)]
    pub codec: OutputCodec,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("hls-output")
}

fn default_temp_root() -> PathBuf {
    env::temp_dir().join("hls-forge")
}

fn default_segment_duration() -> u32 {
    6
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            temp_root: default_temp_root(),
            segment_duration_secs: default_segment_duration(),
            codec: OutputCodec::default(),
        }
    }
}

/// One rung of the bitrate ladder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RungConfig {
    /// Target height in pixels
    pub height: u32,
    /// Quality ordinal, 1 (smallest) to 5 (best)
    pub quality: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Bitrate ladder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LadderConfig {
    #[serde(default = "default_rungs")]
    pub rungs: Vec<RungConfig>,
}

fn default_rungs() -> Vec<RungConfig> {
    vec![
        RungConfig { height: 360, quality: 2, enabled: true },
        RungConfig { height: 480, quality: 2, enabled: true },
        RungConfig { height: 720, quality: 3, enabled: true },
        RungConfig { height: 1080, quality: 3, enabled: true },
        RungConfig { height: 1440, quality: 3, enabled: false },
        RungConfig { height: 2160, quality: 4, enabled: false },
    ]
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            rungs: default_rungs(),
        }
    }
}

/// Process supervision timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Delay between the cooperative and the forceful signal
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Settle time before the verification pass
    #[serde(default = "default_verify_ms")]
    pub verify_ms: u64,
    /// Process names considered during fallback discovery
    #[serde(default = "default_encoder_process_names")]
    pub encoder_process_names: Vec<String>,
}

fn default_grace_ms() -> u64 {
    100
}

fn default_verify_ms() -> u64 {
    150
}

fn default_encoder_process_names() -> Vec<String> {
    vec!["ffmpeg".to_string(), "ffprobe".to_string()]
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            verify_ms: default_verify_ms(),
            encoder_process_names: default_encoder_process_names(),
        }
    }
}

/// Input validation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    /// Check container signatures, not just extensions (default true)
    #[serde(default = "default_strict")]
    pub strict: bool,
}

fn default_strict() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strict: default_strict(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - HLS_ENCODER_PATH -> binaries.encoder
    /// - HLS_PROBER_PATH -> binaries.prober
    /// - HLS_TRANSCRIBER_PATH -> binaries.transcriber
    /// - HLS_OUTPUT_ROOT -> output.root
    /// - HLS_TEMP_ROOT -> output.temp_root
    /// - CPU_LOGICAL_CORES -> concurrency.logical_cores
    /// - HLS_MAX_PARALLEL_JOBS -> concurrency.max_parallel_jobs
    /// - HLS_RENDITIONS_PER_JOB -> concurrency.renditions_per_job
    /// - HLS_STRICT_VALIDATION -> validation.strict
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_path("HLS_ENCODER_PATH") {
            self.binaries.encoder = path;
        }
        if let Some(path) = env_path("HLS_PROBER_PATH") {
            self.binaries.prober = path;
        }
        if let Some(path) = env_path("HLS_TRANSCRIBER_PATH") {
            self.binaries.transcriber = Some(path);
        }
        if let Some(path) = env_path("HLS_OUTPUT_ROOT") {
            self.output.root = path;
        }
        if let Some(path) = env_path("HLS_TEMP_ROOT") {
            self.output.temp_root = path;
        }

        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.concurrency.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("HLS_MAX_PARALLEL_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.concurrency.max_parallel_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("HLS_RENDITIONS_PER_JOB") {
            if let Ok(renditions) = val.parse::<u32>() {
                self.concurrency.renditions_per_job = renditions;
            }
        }

        if let Ok(val) = env::var("HLS_STRICT_VALIDATION") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.validation.strict = true,
                "false" | "0" | "no" => self.validation.strict = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "HLS_ENCODER_PATH",
            "HLS_PROBER_PATH",
            "HLS_TRANSCRIBER_PATH",
            "HLS_OUTPUT_ROOT",
            "HLS_TEMP_ROOT",
            "CPU_LOGICAL_CORES",
            "HLS_MAX_PARALLEL_JOBS",
            "HLS_RENDITIONS_PER_JOB",
            "HLS_STRICT_VALIDATION",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            logical_cores in proptest::option::of(1u32..256),
            max_jobs in 0u32..16,
            renditions in 0u32..8,
            segment in 1u32..20,
            grace in 10u64..2000,
            strict in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[binaries]
encoder = "/opt/ffmpeg/bin/ffmpeg"
prober = "/opt/ffmpeg/bin/ffprobe"

[concurrency]
{}
max_parallel_jobs = {}
renditions_per_job = {}

[output]
segment_duration_secs = {}
codec = "av1"

[supervisor]
grace_ms = {}

[validation]
strict = {}
"#,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                max_jobs,
                renditions,
                segment,
                grace,
                strict
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.binaries.encoder, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
            prop_assert_eq!(config.binaries.prober, PathBuf::from("/opt/ffmpeg/bin/ffprobe"));
            prop_assert_eq!(config.concurrency.logical_cores, logical_cores);
            prop_assert_eq!(config.concurrency.max_parallel_jobs, max_jobs);
            prop_assert_eq!(config.concurrency.renditions_per_job, renditions);
            prop_assert_eq!(config.output.segment_duration_secs, segment);
            prop_assert_eq!(config.output.codec, OutputCodec::Av1);
            prop_assert_eq!(config.supervisor.grace_ms, grace);
            prop_assert_eq!(config.validation.strict, strict);
        }

        #[test]
        fn prop_env_overrides_concurrency(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
            override_renditions in 0u32..8,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[concurrency]
max_parallel_jobs = {}
"#,
                initial_jobs
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("HLS_MAX_PARALLEL_JOBS", override_jobs.to_string());
            env::set_var("HLS_RENDITIONS_PER_JOB", override_renditions.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.concurrency.max_parallel_jobs, override_jobs);
            prop_assert_eq!(config.concurrency.renditions_per_job, override_renditions);
        }

        #[test]
        fn prop_env_overrides_strict_validation(
            initial in proptest::bool::ANY,
            override_strict in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[validation]\nstrict = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("HLS_STRICT_VALIDATION", override_strict.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.validation.strict, override_strict);
        }
    }

    #[test]
    fn test_env_overrides_binary_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("HLS_ENCODER_PATH", "/usr/local/bin/ffmpeg");
        env::set_var("HLS_TRANSCRIBER_PATH", "/usr/local/bin/whisper-cli");
        env::set_var("HLS_OUTPUT_ROOT", "/srv/hls");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.binaries.encoder, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(config.binaries.prober, PathBuf::from("ffprobe"));
        assert_eq!(
            config.binaries.transcriber,
            Some(PathBuf::from("/usr/local/bin/whisper-cli"))
        );
        assert_eq!(config.output.root, PathBuf::from("/srv/hls"));
    }

    #[test]
    fn test_invalid_bool_override_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("HLS_STRICT_VALIDATION", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.validation.strict);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.binaries.encoder, PathBuf::from("ffmpeg"));
        assert_eq!(config.binaries.prober, PathBuf::from("ffprobe"));
        assert!(config.binaries.transcriber.is_none());
        assert_eq!(config.concurrency.logical_cores, None);
        assert_eq!(config.concurrency.max_parallel_jobs, 0);
        assert_eq!(config.concurrency.admissions_per_minute, 60);
        assert_eq!(config.output.segment_duration_secs, 6);
        assert_eq!(config.output.codec, OutputCodec::H264);
        assert_eq!(config.supervisor.grace_ms, 100);
        assert_eq!(config.supervisor.encoder_process_names, vec!["ffmpeg", "ffprobe"]);
        assert!(config.validation.strict);

        let enabled: Vec<u32> = config
            .ladder
            .rungs
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.height)
            .collect();
        assert_eq!(enabled, vec![360, 480, 720, 1080]);
    }

    #[test]
    fn test_ladder_rungs_parse_with_default_enabled() {
        let toml_str = r#"
[ladder]
rungs = [
    { height = 360, quality = 2 },
    { height = 720, quality = 3, enabled = false },
]
"#;
        let config = Config::parse_toml(toml_str).expect("Ladder TOML should parse");

        assert_eq!(config.ladder.rungs.len(), 2);
        assert!(config.ladder.rungs[0].enabled);
        assert!(!config.ladder.rungs[1].enabled);
        assert_eq!(config.ladder.rungs[1].quality, 3);
    }

    #[test]
    fn test_unknown_codec_is_rejected() {
        let result = Config::parse_toml("[output]\ncodec = \"vp9\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
