//! Admission control for capture sessions.
//!
//! Every session needs an [`Admission`] before a supervisor will start it.
//! Checks, in order:
//! - Duration is positive
//! - Duration is within the cap (unless overridden) and the absolute ceiling
//! - Free space covers twice the estimated output on each target volume

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::VolumeProbe;
use crate::capture::{CaptureKind, Lane};
use crate::config::CaptureSettings;
use crate::error::AdmissionError;

const MIB: f64 = 1024.0 * 1024.0;

/// Admission limits and size-estimate constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionLimits {
    /// Longest capture without override (default: 14400 = 4 hours)
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    /// Longest capture even with override (default: 86400 = 24 hours)
    #[serde(default = "default_ceiling")]
    pub ceiling_secs: u64,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u64,

    #[serde(default = "default_bytes_per_sample")]
    pub bytes_per_sample: u64,

    /// Output channels (one mono file each)
    #[serde(default = "default_channels")]
    pub channels: u64,

    /// Estimated raw stream size (default: 2000 MB per hour)
    #[serde(default = "default_video_mb_per_hour")]
    pub video_mb_per_hour: f64,

    /// Applied to every size estimate (default: 1.1)
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    /// Free space must be this multiple of the estimate (default: 2.0)
    #[serde(default = "default_space_multiplier")]
    pub space_multiplier: f64,
}

fn default_max_duration() -> u64 {
    4 * 3600
}
fn default_ceiling() -> u64 {
    crate::domain::MAX_DURATION_SECS
}
fn default_sample_rate() -> u64 {
    48_000
}
fn default_bytes_per_sample() -> u64 {
    2
} // 16-bit PCM
fn default_channels() -> u64 {
    2
}
fn default_video_mb_per_hour() -> f64 {
    2000.0
}
fn default_safety_margin() -> f64 {
    1.1
}
fn default_space_multiplier() -> f64 {
    2.0
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration(),
            ceiling_secs: default_ceiling(),
            sample_rate: default_sample_rate(),
            bytes_per_sample: default_bytes_per_sample(),
            channels: default_channels(),
            video_mb_per_hour: default_video_mb_per_hour(),
            safety_margin: default_safety_margin(),
            space_multiplier: default_space_multiplier(),
        }
    }
}

impl AdmissionLimits {
    /// Estimated bytes for both audio channel files
    pub fn audio_estimate(&self, duration_secs: u64) -> u64 {
        let raw = duration_secs * self.sample_rate * self.bytes_per_sample * self.channels;
        (raw as f64 * self.safety_margin).ceil() as u64
    }

    /// Estimated bytes for the raw stream copy
    pub fn video_estimate(&self, duration_secs: u64) -> u64 {
        let hours = duration_secs as f64 / 3600.0;
        (hours * self.video_mb_per_hour * MIB * self.safety_margin).ceil() as u64
    }

    /// Free space a volume needs for `estimate` bytes of output
    pub fn required_free(&self, estimate: u64) -> u64 {
        (estimate as f64 * self.space_multiplier).ceil() as u64
    }

    /// Hours of raw video that fit in `free_bytes`
    pub fn video_hours_for(&self, free_bytes: u64) -> f64 {
        free_bytes as f64 / MIB / self.video_mb_per_hour
    }

    /// Duration checks only
    pub fn check_duration(&self, duration_secs: u64, allow_override: bool) -> Result<(), AdmissionError> {
        if duration_secs == 0 {
            return Err(AdmissionError::InvalidDuration {
                requested: duration_secs,
            });
        }
        if duration_secs > self.ceiling_secs {
            return Err(AdmissionError::DurationAboveCeiling {
                requested: duration_secs,
                ceiling: self.ceiling_secs,
            });
        }
        if duration_secs > self.max_duration_secs && !allow_override {
            return Err(AdmissionError::DurationExceeded {
                requested: duration_secs,
                limit: self.max_duration_secs,
            });
        }
        Ok(())
    }
}

/// Proof that a session passed admission.
///
/// Only [`AdmissionController::admit`] constructs one.
#[derive(Debug, Clone)]
pub struct Admission {
    lanes: CaptureKind,
    duration_secs: u64,
    admitted_at: DateTime<Utc>,
}

impl Admission {
    pub fn lanes(&self) -> CaptureKind {
        self.lanes
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    /// Whether this admission allows a session on `lane`
    pub fn covers(&self, lane: Lane) -> bool {
        self.lanes.includes(lane)
    }
}

/// Space requirement for one volume
struct VolumeNeed {
    path: PathBuf,
    required: u64,
}

/// Runs the duration and disk-space preflight
pub struct AdmissionController {
    volumes: Arc<dyn VolumeProbe>,
    limits: AdmissionLimits,
}

impl AdmissionController {
    pub fn new(volumes: Arc<dyn VolumeProbe>, limits: AdmissionLimits) -> Self {
        Self { volumes, limits }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Admit a capture of `duration_secs` on `lanes`, or say why not
    pub fn admit(
        &self,
        duration_secs: u64,
        allow_override: bool,
        lanes: CaptureKind,
        settings: &CaptureSettings,
    ) -> Result<Admission, AdmissionError> {
        self.limits.check_duration(duration_secs, allow_override)?;

        let mut targets: Vec<(&Path, u64)> = Vec::new();
        if lanes.includes(Lane::Audio) {
            targets.push((&settings.audio_dir, self.limits.audio_estimate(duration_secs)));
        }
        if lanes.includes(Lane::Video) {
            targets.push((&settings.video_dir, self.limits.video_estimate(duration_secs)));
        }

        // Lanes on the same volume share its free space
        let mut needs: BTreeMap<u64, VolumeNeed> = BTreeMap::new();
        for (path, estimate) in targets {
            let volume = self
                .volumes
                .volume_id(path)
                .map_err(|e| AdmissionError::SpaceUnknown {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            let required = self.limits.required_free(estimate);
            needs
                .entry(volume)
                .and_modify(|need| need.required += required)
                .or_insert(VolumeNeed {
                    path: path.to_path_buf(),
                    required,
                });
        }

        for need in needs.values() {
            let available = self
                .volumes
                .free_bytes(&need.path)
                .map_err(|e| AdmissionError::SpaceUnknown {
                    path: need.path.clone(),
                    reason: e.to_string(),
                })?;
            debug!(
                path = %need.path.display(),
                required = need.required,
                available,
                "Space check"
            );
            if available < need.required {
                let err = AdmissionError::InsufficientSpace {
                    path: need.path.clone(),
                    required: need.required,
                    available,
                };
                warn!("{}", err);
                return Err(err);
            }
        }

        Ok(Admission {
            lanes,
            duration_secs,
            admitted_at: Utc::now(),
        })
    }
}
