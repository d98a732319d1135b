//! Capture supervisors and the transcode pipeline.
//!
//! - `audio`: one dual-mono ALSA capture at a time
//! - `video`: one raw RTSP stream copy at a time, handed to transcode
//! - `transcode`: background re-encode of finished raw captures
//! - `devices`: capture device selection
//! - `lane`: process supervision shared by both capture lanes

pub mod audio;
pub mod devices;
pub mod lane;
pub mod transcode;
pub mod video;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CaptureConfig;
use crate::error::CaptureError;

pub use audio::{AudioRequest, AudioState, AudioStatus, AudioSupervisor};
pub use devices::DeviceSelector;
pub use lane::SessionHandle;
pub use transcode::{CancelResult, TaskId, TaskSnapshot, TaskState, TranscodePipeline};
pub use video::{VideoRequest, VideoState, VideoStatus, VideoSupervisor};

/// One independent capture resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Audio,
    Video,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which lanes a capture request uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Audio,
    Video,
    Both,
}

impl CaptureKind {
    pub fn includes(self, lane: Lane) -> bool {
        matches!(
            (self, lane),
            (Self::Both, _) | (Self::Audio, Lane::Audio) | (Self::Video, Lane::Video)
        )
    }

    pub fn lanes(self) -> Vec<Lane> {
        [Lane::Audio, Lane::Video]
            .into_iter()
            .filter(|lane| self.includes(*lane))
            .collect()
    }

    /// Audio always; video only when the job asks for it
    pub fn for_job(capture_video: bool) -> Self {
        if capture_video {
            Self::Both
        } else {
            Self::Audio
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Both => write!(f, "both"),
        }
    }
}

impl FromStr for CaptureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "both" => Ok(Self::Both),
            other => Err(format!("Unknown capture kind: {} (expected audio, video or both)", other)),
        }
    }
}

/// Timeouts and thresholds for supervised processes
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ffmpeg_path: String,

    /// Spawn must complete within this
    pub start_timeout: Duration,

    /// Graceful stop must complete within this before a kill
    pub stop_grace: Duration,

    /// Audio outputs must be larger than this
    pub min_output_bytes: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for SupervisorSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            start_timeout: Duration::from_secs(config.start_timeout_secs),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            min_output_bytes: config.min_output_bytes,
        }
    }
}

/// Why a session's process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The process exited by itself
    Exited,

    /// The supervisor's duration timer fired
    DurationReached,

    /// `stop()` was called
    StopRequested,

    /// Graceful stop timed out
    ForceKilled,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => write!(f, "exited"),
            Self::DurationReached => write!(f, "duration reached"),
            Self::StopRequested => write!(f, "stopped"),
            Self::ForceKilled => write!(f, "force-killed"),
        }
    }
}

/// Details of the running session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub lane: Lane,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outputs: Vec<PathBuf>,
    pub pid: Option<u32>,
}

/// Terminal result of one session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub lane: Lane,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ended_by: EndReason,

    /// Verified output files, or why the session failed
    pub result: Result<Vec<PathBuf>, CaptureError>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Failure reason, if any
    pub fn error(&self) -> Option<String> {
        self.result.as_ref().err().map(|e| e.to_string())
    }
}

/// Result of asking a lane to stop
#[derive(Debug, Clone)]
pub enum StopResult {
    Stopped(SessionOutcome),
    NothingInProgress,
}

impl StopResult {
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        match self {
            Self::Stopped(outcome) => Some(outcome),
            Self::NothingInProgress => None,
        }
    }
}

/// Filesystem-safe stem for output files
pub fn sanitize_stem(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let collapsed = cleaned
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if collapsed.is_empty() {
        "recording".to_string()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_kind_lanes() {
        assert_eq!(CaptureKind::Both.lanes(), vec![Lane::Audio, Lane::Video]);
        assert_eq!(CaptureKind::Video.lanes(), vec![Lane::Video]);
        assert!(!CaptureKind::Audio.includes(Lane::Video));
        assert_eq!(CaptureKind::for_job(false), CaptureKind::Audio);
        assert_eq!("both".parse::<CaptureKind>().unwrap(), CaptureKind::Both);
    }

    #[test]
    fn test_sanitize_stem() {
        assert_eq!(sanitize_stem("Sunday Service"), "Sunday_Service");
        assert_eq!(sanitize_stem("  a/b:c  "), "a_b_c");
        assert_eq!(sanitize_stem("///"), "recording");
    }
}
