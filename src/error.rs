//! Error taxonomy for capture scheduling.
//!
//! Every rejection carries the specific reason that caused it. Admission and
//! concurrency errors happen before any process is spawned; process, storage
//! and transcode errors can also surface mid-session and end up in the
//! instance ledger as the `failed` reason.

use std::path::PathBuf;

use thiserror::Error;

/// Format a byte count the way operators read disk sizes
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}

fn human(bytes: &u64) -> String {
    format_bytes(*bytes)
}

/// Admission preflight rejections
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    #[error("Duration must be positive, got {requested}s")]
    InvalidDuration { requested: u64 },

    #[error("Duration {requested}s exceeds the {limit}s limit; enable override for longer captures")]
    DurationExceeded { requested: u64, limit: u64 },

    #[error("Duration {requested}s exceeds the absolute ceiling of {ceiling}s")]
    DurationAboveCeiling { requested: u64, ceiling: u64 },

    #[error(
        "Insufficient disk space on {}: need {}, have {}",
        .path.display(),
        human(.required),
        human(.available)
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Cannot read free space for {}: {reason}", .path.display())]
    SpaceUnknown { path: PathBuf, reason: String },

    #[error("Session not covered by admission: {0}")]
    NotCovered(String),
}

/// Errors from the capture supervisors and transcode pipeline
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transcode error: {0}")]
    Transcode(String),

    #[error("{0}")]
    Concurrency(String),
}

impl CaptureError {
    /// Short category label for status output and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Admission(_) => "admission",
            Self::Device(_) => "device",
            Self::Process(_) => "process",
            Self::Storage(_) => "storage",
            Self::Transcode(_) => "transcode",
            Self::Concurrency(_) => "concurrency",
        }
    }
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("A template named '{0}' already exists")]
    DuplicateTemplate(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}
