//! recdeck - Unattended audio/video capture scheduler
//!
//! Schedules one-time and recurring capture windows on a small recorder
//! box, supervises the ffmpeg processes that do the recording, and keeps a
//! durable record of what actually happened for every occurrence.
//!
//! # Architecture
//!
//! - Jobs describe intent; occurrences are resolved from their recurrence
//! - Every occurrence that was attempted gets an instance in the ledger;
//!   past gaps are filled by inference from output files
//! - Captures are admitted (duration cap, disk space) before any process
//!   is spawned, and each lane (audio, video) runs one session at a time
//! - Finished raw video is re-encoded by a background transcode queue
//!
//! # Modules
//!
//! - `adapters`: Host integrations (processes, ALSA, volumes, ffprobe)
//! - `capture`: Lane supervisors and the transcode pipeline
//! - `core`: Resolver, ledger, admission, driver and control surface
//! - `domain`: Data structures (Job, RecurrencePattern, Instance, Template)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Weekly rehearsal capture, audio only
//! recdeck job add "Rehearsal" --start "2026-10-05 09:00" --duration 30m \
//!     --weekly mon,wed,fri
//!
//! # Or save the shape once and reuse it
//! recdeck template add "Choir" --duration 90m --weekly tue --at 19:30
//! recdeck job add "Choir autumn" --start "2026-10-06 19:30" --template Choir
//!
//! # Run the scheduler
//! recdeck run
//!
//! # What happened over the last two weeks
//! recdeck occurrences --from 2026-10-01 --to 2026-10-14
//! ```

pub mod adapters;
pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use crate::core::{Control, Driver, Recorder, Store};
pub use capture::{CaptureKind, Lane};
pub use domain::{Instance, InstanceStatus, Job, JobDefinition, JobId, RecurrencePattern};
pub use error::{AdmissionError, CaptureError, StoreError};
