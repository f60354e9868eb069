//! Input validation run before a job is queued.
//!
//! Two validators share one trait: [`SignatureValidator`] checks the file's
//! magic bytes against its extension, [`ExtensionValidator`] only looks at the
//! name. Which one is used is decided once from configuration.

use crate::config::ValidationConfig;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Bytes read from the head of a file for signature checks
const SIGNATURE_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Input not found: {0}")]
    NotFound(PathBuf),

    #[error("Input is not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("Input is empty: {0}")]
    Empty(PathBuf),

    #[error("Unsupported file extension: {0}")]
    UnsupportedExtension(String),

    #[error("File contents of {path} do not match a {container} container")]
    SignatureMismatch { path: PathBuf, container: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container families recognised by extension and magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFamily {
    /// MP4, MOV, M4V, 3GP (ISO base media)
    IsoBmff,
    /// Matroska and WebM
    Matroska,
    Avi,
    /// MPEG transport stream, including 192-byte M2TS packets
    MpegTs,
    /// MPEG program stream
    MpegPs,
    Flv,
    /// WMV/ASF
    Asf,
}

impl ContainerFamily {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let family = match ext.to_ascii_lowercase().as_str() {
            "mp4" | "m4v" | "mov" | "3gp" => ContainerFamily::IsoBmff,
            "mkv" | "webm" => ContainerFamily::Matroska,
            "avi" => ContainerFamily::Avi,
            "ts" | "mts" | "m2ts" => ContainerFamily::MpegTs,
            "mpg" | "mpeg" => ContainerFamily::MpegPs,
            "flv" => ContainerFamily::Flv,
            "wmv" | "asf" => ContainerFamily::Asf,
            _ => return None,
        };
        Some(family)
    }

    /// Whether a file head looks like this container
    pub fn matches(&self, head: &[u8]) -> bool {
        match self {
            ContainerFamily::IsoBmff => {
                head.len() >= 8
                    && matches!(&head[4..8], b"ftyp" | b"moov" | b"mdat" | b"wide" | b"free" | b"skip")
            }
            ContainerFamily::Matroska => head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]),
            ContainerFamily::Avi => head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"AVI ",
            ContainerFamily::MpegTs => head.first() == Some(&0x47) || head.get(4) == Some(&0x47),
            ContainerFamily::MpegPs => head.starts_with(&[0x00, 0x00, 0x01, 0xBA]),
            ContainerFamily::Flv => head.starts_with(b"FLV"),
            ContainerFamily::Asf => head.starts_with(&[0x30, 0x26, 0xB2, 0x75]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFamily::IsoBmff => "mp4",
            ContainerFamily::Matroska => "matroska",
            ContainerFamily::Avi => "avi",
            ContainerFamily::MpegTs => "mpeg-ts",
            ContainerFamily::MpegPs => "mpeg-ps",
            ContainerFamily::Flv => "flv",
            ContainerFamily::Asf => "asf",
        }
    }
}

/// Checks a candidate input before a job is created
pub trait InputValidator: Send + Sync {
    fn validate(&self, path: &Path) -> Result<(), ValidationError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Extension and magic-byte validation
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureValidator;

/// Extension-only validation, for when reading file heads is not wanted
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionValidator;

impl InputValidator for SignatureValidator {
    fn validate(&self, path: &Path) -> Result<(), ValidationError> {
        let family = check_extension(path)?;
        let len = check_regular_file(path)?;
        if len == 0 {
            return Err(ValidationError::Empty(path.to_path_buf()));
        }

        let mut head = Vec::with_capacity(SIGNATURE_LEN);
        File::open(path)?
            .take(SIGNATURE_LEN as u64)
            .read_to_end(&mut head)?;

        if family.matches(&head) {
            Ok(())
        } else {
            Err(ValidationError::SignatureMismatch {
                path: path.to_path_buf(),
                container: family.as_str().to_string(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "signature"
    }
}

impl InputValidator for ExtensionValidator {
    fn validate(&self, path: &Path) -> Result<(), ValidationError> {
        check_extension(path)?;
        check_regular_file(path)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "extension"
    }
}

fn check_extension(path: &Path) -> Result<ContainerFamily, ValidationError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    ContainerFamily::from_extension(ext)
        .ok_or_else(|| ValidationError::UnsupportedExtension(ext.to_string()))
}

fn check_regular_file(path: &Path) -> Result<u64, ValidationError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(ValidationError::NotAFile(path.to_path_buf()));
    }
    Ok(meta.len())
}

/// Validator selected from configuration
pub fn validator_for(cfg: &ValidationConfig) -> Arc<dyn InputValidator> {
    if cfg.strict {
        Arc::new(SignatureValidator)
    } else {
        Arc::new(ExtensionValidator)
    }
}
