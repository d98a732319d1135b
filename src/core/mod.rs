//! Core scheduling logic.
//!
//! This module contains:
//! - Resolver: recurrence pattern → occurrence instants
//! - Store / Ledger: durable jobs and per-occurrence instances
//! - Admission: duration and disk-space preflight
//! - Recorder: wiring of supervisors, pipeline and host adapters
//! - Driver: the timer loop that triggers scheduled captures
//! - Control: operations exposed to front-ends

pub mod admission;
pub mod control;
pub mod driver;
pub mod ledger;
pub mod recorder;
pub mod resolver;
pub mod store;

// Re-export commonly used types
pub use admission::{Admission, AdmissionController, AdmissionLimits};
pub use control::{Control, Decision, ManualCapture, OccurrenceView, StopReport, SystemStatus};
pub use driver::{expected_outputs, Driver, DriverSettings, RecoveryReport, TickReport};
pub use ledger::{Ledger, OutputEvidence};
pub use recorder::{Host, Recorder};
pub use resolver::{next_occurrence, resolve_occurrences};
pub use store::Store;
