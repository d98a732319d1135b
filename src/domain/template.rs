//! Recording templates: named presets that new jobs start from.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobDefinition, MAX_DURATION_SECS};
use super::recurrence::RecurrencePattern;

/// Operator-supplied template fields (used for create and update)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    /// Unique name
    pub name: String,

    pub duration_secs: u64,

    /// None for one-time captures
    #[serde(default)]
    pub recurrence: Option<RecurrencePattern>,

    #[serde(default)]
    pub capture_video: bool,

    #[serde(default)]
    pub description: String,
}

impl TemplateDefinition {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Template name cannot be empty".to_string());
        }
        if self.duration_secs == 0 || self.duration_secs > MAX_DURATION_SECS {
            return Err(format!(
                "Duration must be between 1 and {} seconds, got {}",
                MAX_DURATION_SECS, self.duration_secs
            ));
        }
        if let Some(pattern) = &self.recurrence {
            pattern.validate()?;
        }
        Ok(())
    }
}

/// A stored template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub duration_secs: u64,
    pub recurrence: Option<RecurrencePattern>,
    pub capture_video: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Fields for a job called `name` starting at `start`
    pub fn job_definition(&self, name: String, start: NaiveDateTime) -> JobDefinition {
        JobDefinition {
            name,
            start,
            duration_secs: self.duration_secs,
            recurrence: self.recurrence.clone(),
            capture_video: self.capture_video,
            allow_override: false,
            notes: self.description.clone(),
        }
    }

    /// One-line description, e.g. "Rehearsal: 1h 30m, Daily at 09:00"
    pub fn summary(&self) -> String {
        let minutes = self.duration_secs / 60;
        let length = match (minutes / 60, minutes % 60) {
            (0, m) => format!("{}m", m),
            (h, m) => format!("{}h {}m", h, m),
        };
        let schedule = match &self.recurrence {
            None => "One-time recording".to_string(),
            Some(pattern) => pattern.to_string(),
        };
        let video = if self.capture_video { ", with video" } else { "" };
        format!("{}: {}, {}{}", self.name, length, schedule, video)
    }
}
