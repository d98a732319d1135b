//! Scheduled capture jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::recurrence::{RecurrencePattern, TimeWindow};

pub type JobId = Uuid;

/// Longest capture any job may ask for, override or not
pub const MAX_DURATION_SECS: u64 = 24 * 3600;

// chrono durations hold i64 milliseconds
const MAX_DELTA_SECS: i64 = i64::MAX / 1000;

/// Operator-supplied job fields (used for create and update)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Display name; also the stem of output filenames
    pub name: String,

    /// First eligible start (local time)
    pub start: NaiveDateTime,

    /// Capture length in seconds
    pub duration_secs: u64,

    /// None for a one-time job
    #[serde(default)]
    pub recurrence: Option<RecurrencePattern>,

    /// Also record the camera stream
    #[serde(default)]
    pub capture_video: bool,

    /// Lift the 4-hour duration cap
    #[serde(default)]
    pub allow_override: bool,

    #[serde(default)]
    pub notes: String,
}

impl JobDefinition {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Job name cannot be empty".to_string());
        }
        if self.duration_secs == 0 {
            return Err("Duration must be positive".to_string());
        }
        if self.duration_secs > MAX_DURATION_SECS {
            return Err(format!(
                "Duration {}s exceeds the {}s ceiling",
                self.duration_secs, MAX_DURATION_SECS
            ));
        }
        if let Some(pattern) = &self.recurrence {
            pattern.validate()?;
        }
        Ok(())
    }
}

/// Lifecycle of a job definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for triggering
    Active,

    /// Kept but skipped by the driver
    Paused,

    /// One-time job whose occurrence has been handled
    Finished,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "finished" => Ok(Self::Finished),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// A persisted job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub start: NaiveDateTime,
    pub duration_secs: u64,
    pub recurrence: Option<RecurrencePattern>,
    pub capture_video: bool,
    pub allow_override: bool,
    pub status: JobStatus,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a new active job from a definition
    pub fn new(definition: JobDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: definition.name,
            start: definition.start,
            duration_secs: definition.duration_secs,
            recurrence: definition.recurrence,
            capture_video: definition.capture_video,
            allow_override: definition.allow_override,
            status: JobStatus::Active,
            notes: definition.notes,
            created_at: Utc::now(),
        }
    }

    /// Replace the operator-editable fields
    pub fn apply(&mut self, definition: JobDefinition) {
        self.name = definition.name;
        self.start = definition.start;
        self.duration_secs = definition.duration_secs;
        self.recurrence = definition.recurrence;
        self.capture_video = definition.capture_video;
        self.allow_override = definition.allow_override;
        self.notes = definition.notes;
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Saturates rather than panicking on durations stored out of range
    pub fn duration(&self) -> chrono::Duration {
        let secs = i64::try_from(self.duration_secs).unwrap_or(MAX_DELTA_SECS);
        chrono::Duration::seconds(secs.min(MAX_DELTA_SECS))
    }

    /// End of the window starting at `start`; None if it is not representable
    pub fn end_of(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        start.checked_add_signed(self.duration())
    }

    /// Occurrence starts inside `window`, never earlier than the job's start
    pub fn occurrences(&self, window: TimeWindow) -> Vec<NaiveDateTime> {
        match &self.recurrence {
            None => {
                if window.contains(self.start) {
                    vec![self.start]
                } else {
                    Vec::new()
                }
            }
            Some(pattern) => {
                let clipped = TimeWindow::new(window.start.max(self.start), window.end);
                crate::core::resolver::resolve_occurrences(pattern, clipped)
            }
        }
    }

    /// Filename stem for the occurrence starting at `start`
    pub fn output_stem(&self, start: NaiveDateTime) -> String {
        format!(
            "{}_{}",
            crate::capture::sanitize_stem(&self.name),
            start.format("%Y%m%d_%H%M")
        )
    }

    /// Start of this job's occurrence on `date`, if it has one
    pub fn occurrence_on(&self, date: chrono::NaiveDate) -> Option<NaiveDateTime> {
        match &self.recurrence {
            None => (self.start.date() == date).then_some(self.start),
            Some(pattern) => {
                let start = pattern.at(date);
                (pattern.matches_date(date) && start >= self.start).then_some(start)
            }
        }
    }

    /// Human-readable schedule summary
    pub fn schedule_summary(&self) -> String {
        match &self.recurrence {
            None => format!("Once at {}", self.start.format("%Y-%m-%d %H:%M")),
            Some(pattern) => pattern.to_string(),
        }
    }
}
