//! Control surface over jobs, occurrences and the capture lanes.
//!
//! This is what a front-end (the CLI here) talks to. Manual captures go
//! through the same admission controller and supervisors as scheduled ones.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::driver::expected_outputs;
use super::recorder::Recorder;
use crate::adapters::Device;
use crate::capture::{
    AudioRequest, AudioStatus, CancelResult, CaptureKind, Lane, SessionHandle,
    StopResult, TaskId, TaskSnapshot, VideoRequest, VideoStatus,
};
use crate::domain::{
    InstanceStatus, Job, JobDefinition, JobId, JobStatus, Provenance, Template,
    TemplateDefinition, TimeWindow,
};
use crate::error::{CaptureError, StoreError};

/// One resolved occurrence and what happened to it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccurrenceView {
    pub job_id: JobId,
    pub job_name: String,
    pub date: NaiveDate,
    pub start: NaiveDateTime,
    pub status: InstanceStatus,

    /// None while no instance has been written
    pub provenance: Option<Provenance>,

    pub notes: String,
}

/// Answer to a manual capture request
#[derive(Debug)]
pub enum Decision {
    Started(ManualCapture),
    Rejected(String),
}

impl Decision {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

/// Sessions started by one manual request
#[derive(Debug)]
pub struct ManualCapture {
    pub stem: String,
    pub sessions: Vec<SessionHandle>,

    /// Lanes that were requested but could not start
    pub failures: Vec<(Lane, String)>,
}

/// Per-lane result of a stop request
#[derive(Debug, Clone)]
pub struct StopReport {
    pub audio: Option<StopResult>,
    pub video: Option<StopResult>,
}

#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub audio: AudioStatus,
    pub video: VideoStatus,
    pub transcode: Vec<TaskSnapshot>,
}

pub struct Control {
    recorder: Recorder,
}

impl Control {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    // Jobs

    pub fn create_job(&self, definition: JobDefinition) -> Result<JobId> {
        definition.validate().map_err(StoreError::InvalidJob)?;
        let job = Job::new(definition);
        self.recorder
            .store
            .insert_job(&job)
            .context("Failed to save job")?;
        info!(job = %job.id, name = %job.name, schedule = %job.schedule_summary(), "Created job");
        Ok(job.id)
    }

    pub fn update_job(&self, id: JobId, definition: JobDefinition) -> Result<()> {
        definition.validate().map_err(StoreError::InvalidJob)?;
        let mut job = self.recorder.store.get_job(id)?;
        job.apply(definition);
        self.recorder.store.update_job(&job)?;
        info!(job = %id, "Updated job");
        Ok(())
    }

    /// Delete a job and every instance recorded for it
    pub fn delete_job(&self, id: JobId) -> Result<()> {
        self.recorder.store.delete_job(id)?;
        info!(job = %id, "Deleted job");
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        Ok(self.recorder.store.get_job(id)?)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.recorder.store.list_jobs()?)
    }

    pub fn pause_job(&self, id: JobId) -> Result<()> {
        self.recorder.store.set_job_status(id, JobStatus::Paused)?;
        Ok(())
    }

    pub fn resume_job(&self, id: JobId) -> Result<()> {
        self.recorder.store.set_job_status(id, JobStatus::Active)?;
        Ok(())
    }

    // Templates

    pub fn create_template(&self, definition: TemplateDefinition) -> Result<Template> {
        definition.validate().map_err(StoreError::InvalidTemplate)?;
        let template = self.recorder.store.insert_template(&definition)?;
        info!(template = %template.name, summary = %template.summary(), "Created template");
        Ok(template)
    }

    pub fn get_template(&self, name: &str) -> Result<Template> {
        Ok(self.recorder.store.get_template(name)?)
    }

    pub fn list_templates(&self) -> Result<Vec<Template>> {
        Ok(self.recorder.store.list_templates()?)
    }

    /// Replace a template's fields; jobs already made from it keep theirs
    pub fn update_template(&self, name: &str, definition: TemplateDefinition) -> Result<Template> {
        definition.validate().map_err(StoreError::InvalidTemplate)?;
        let template = self.recorder.store.update_template(name, &definition)?;
        info!(template = %name, summary = %template.summary(), "Updated template");
        Ok(template)
    }

    pub fn delete_template(&self, name: &str) -> Result<()> {
        self.recorder.store.delete_template(name)?;
        info!(template = %name, "Deleted template");
        Ok(())
    }

    // Occurrences

    /// Occurrences between `from` and `to` inclusive, as of now
    pub fn list_occurrences(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<OccurrenceView>> {
        self.list_occurrences_at(from, to, Local::now().naive_local())
    }

    /// Occurrences between `from` and `to` inclusive.
    ///
    /// Occurrences that ended before `now` with no instance are repaired
    /// from output files. Paused jobs are listed but not repaired.
    pub fn list_occurrences_at(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<Vec<OccurrenceView>> {
        if from > to {
            anyhow::bail!("Range start {} is after its end {}", from, to);
        }
        let window = TimeWindow::days(from, to);
        let settings = self.recorder.config.capture_settings()?;
        let ledger = &self.recorder.ledger;

        let mut views = Vec::new();
        for job in self.recorder.store.list_jobs()? {
            for start in job.occurrences(window) {
                let date = start.date();
                let ended = job.end_of(start).map_or(false, |end| end <= now);

                let instance = match ledger.get_instance(job.id, date)? {
                    Some(instance) => Some(instance),
                    None if ended && job.status != JobStatus::Paused => {
                        let evidence =
                            expected_outputs(&job, start, &settings, self.recorder.min_output_bytes);
                        Some(ledger.repair(job.id, date, &evidence)?)
                    }
                    None => None,
                };

                views.push(match instance {
                    Some(instance) => OccurrenceView {
                        job_id: job.id,
                        job_name: job.name.clone(),
                        date,
                        start,
                        status: instance.status,
                        provenance: Some(instance.provenance),
                        notes: instance.notes,
                    },
                    None => OccurrenceView {
                        job_id: job.id,
                        job_name: job.name.clone(),
                        date,
                        start,
                        status: InstanceStatus::Pending,
                        provenance: None,
                        notes: String::new(),
                    },
                });
            }
        }

        views.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.job_name.cmp(&b.job_name)));
        Ok(views)
    }

    // Captures

    /// Admit and start an operator-initiated capture.
    ///
    /// Busy lanes and admission failures reject before anything spawns.
    /// With `Both`, a lane that fails to start does not stop the other.
    #[instrument(skip(self))]
    pub async fn start_manual_capture(
        &self,
        kind: CaptureKind,
        duration_secs: u64,
        allow_override: bool,
    ) -> Result<Decision> {
        let busy: Vec<String> = kind
            .lanes()
            .into_iter()
            .filter(|lane| match lane {
                Lane::Audio => self.recorder.audio.is_busy(),
                Lane::Video => self.recorder.video.is_busy(),
            })
            .map(|lane| format!("{} capture already in progress", lane))
            .collect();
        if !busy.is_empty() {
            return Ok(Decision::Rejected(busy.join("; ")));
        }

        let settings = self.recorder.config.capture_settings()?;
        let admission = match self.recorder.admission.admit(
            duration_secs,
            allow_override,
            kind,
            &settings,
        ) {
            Ok(admission) => admission,
            Err(e) => {
                warn!(reason = %e, "Manual capture rejected");
                return Ok(Decision::Rejected(e.to_string()));
            }
        };

        let stem = format!("manual_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let duration = Duration::from_secs(duration_secs);
        let mut sessions = Vec::new();
        let mut failures = Vec::new();

        for lane in kind.lanes() {
            let started: Result<SessionHandle, CaptureError> = match lane {
                Lane::Audio => {
                    let request = AudioRequest::from_settings(&settings, stem.clone(), duration);
                    self.recorder.audio.start(&admission, request).await
                }
                Lane::Video => match VideoRequest::from_settings(&settings, stem.clone(), duration)
                {
                    Ok(request) => self.recorder.video.start(&admission, request).await,
                    Err(e) => Err(e),
                },
            };
            match started {
                Ok(handle) => sessions.push(handle),
                Err(e) => {
                    warn!(lane = %lane, error = %e, "Manual capture lane did not start");
                    failures.push((lane, e.to_string()));
                }
            }
        }

        if sessions.is_empty() {
            let reasons: Vec<String> = failures
                .iter()
                .map(|(lane, reason)| format!("{}: {}", lane, reason))
                .collect();
            return Ok(Decision::Rejected(reasons.join("; ")));
        }

        info!(stem = %stem, lanes = sessions.len(), "Manual capture started");
        Ok(Decision::Started(ManualCapture {
            stem,
            sessions,
            failures,
        }))
    }

    /// Stop the lanes in `kind`; idle lanes report `NothingInProgress`
    pub async fn stop_capture(&self, kind: CaptureKind) -> StopReport {
        let audio = if kind.includes(Lane::Audio) {
            Some(self.recorder.audio.stop().await)
        } else {
            None
        };
        let video = if kind.includes(Lane::Video) {
            Some(self.recorder.video.stop().await)
        } else {
            None
        };
        StopReport { audio, video }
    }

    pub fn get_status(&self) -> SystemStatus {
        SystemStatus {
            audio: self.recorder.audio.status(),
            video: self.recorder.video.status(),
            transcode: self.recorder.pipeline.snapshot(),
        }
    }

    pub fn cancel_transcode(&self, task: TaskId) -> CancelResult {
        self.recorder.pipeline.cancel(task)
    }

    /// Capture devices as enumerated right now
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.recorder.host.devices.list_devices().await
    }

    // Key-value settings consumed by the capture path

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.recorder.store.get_config(key)?)
    }

    /// Save a setting; values the next tick could not use are rolled back
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let store = &self.recorder.store;
        let previous = store.get_config(key)?;
        store.set_config(key, value)?;

        if let Err(e) = self.recorder.config.capture_settings() {
            match previous {
                Some(old) => store.set_config(key, &old)?,
                None => {
                    store.unset_config(key)?;
                }
            }
            return Err(e.context(format!("Rejected setting '{}'", key)));
        }
        Ok(())
    }

    pub fn unset_setting(&self, key: &str) -> Result<bool> {
        Ok(self.recorder.store.unset_config(key)?)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        Ok(self.recorder.store.list_config()?)
    }
}
