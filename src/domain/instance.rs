//! Per-occurrence execution records.
//!
//! An Instance is what actually happened for one occurrence of a job. Live
//! instances are written while the driver executes; inferred instances are
//! reconstructed later from output files and may be wrong if files were
//! deleted, so consumers can tell the two apart.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;

/// Outcome status of an occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Recording,
    Completed,
    Failed,
    Missed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Recording => "recording",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further transitions expected
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Missed | Self::Cancelled
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "recording" => Ok(Self::Recording),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "missed" => Ok(Self::Missed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown instance status: {}", other)),
        }
    }
}

/// Where an instance record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Written at execution time
    Live,

    /// Reconstructed from output files during repair
    Inferred,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Inferred => "inferred",
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "inferred" => Ok(Self::Inferred),
            other => Err(format!("Unknown provenance: {}", other)),
        }
    }
}

/// Execution record for one (job, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub job_id: JobId,
    pub occurrence_date: NaiveDate,
    pub status: InstanceStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: String,
    pub provenance: Provenance,
}

/// Fields written by `record_outcome`
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl Outcome {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn finished(at: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}
