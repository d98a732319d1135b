//! Domain types for the capture scheduler.
//!
//! This module contains the core data structures:
//! - Job: Operator intent (one-time or recurring capture window)
//! - Recurrence: Day rules, weekday sets, time windows
//! - Instance: What actually happened for one occurrence
//! - Template: Named presets new jobs start from

pub mod instance;
pub mod job;
pub mod recurrence;
pub mod template;

// Re-export commonly used types
pub use instance::{Instance, InstanceStatus, Outcome, Provenance};
pub use job::{Job, JobDefinition, JobId, JobStatus, MAX_DURATION_SECS};
pub use recurrence::{Recurrence, RecurrencePattern, TimeWindow, WeekdaySet};
pub use template::{Template, TemplateDefinition};
