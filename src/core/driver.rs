//! Scheduling driver.
//!
//! Wakes on a fixed tick, finds occurrences whose capture window contains
//! the current time, and takes each through admission, supervisor start
//! and ledger updates. Configuration is re-read on every tick. A failure in
//! one job is logged and never stops the loop or other jobs.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::ledger::OutputEvidence;
use super::recorder::Recorder;
use crate::capture::audio::audio_outputs;
use crate::capture::video::processed_path;
use crate::capture::{
    AudioRequest, CaptureKind, Lane, SessionHandle, SessionOutcome, VideoRequest,
};
use crate::config::{CaptureSettings, DriverConfig};
use crate::domain::{InstanceStatus, Job, JobId, JobStatus, Outcome, TimeWindow};

/// Loop timing
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub tick: Duration,

    /// An occurrence may still start this long after its scheduled time
    pub start_tolerance: chrono::Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&DriverConfig::default())
    }
}

impl From<&DriverConfig> for DriverSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.tick_secs.max(1)),
            start_tolerance: chrono::Duration::seconds(config.start_tolerance_secs as i64),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub triggered: Vec<(JobId, NaiveDate)>,
    pub missed: Vec<(JobId, NaiveDate)>,

    /// Rejected by admission or failed to start, with the reason
    pub failed: Vec<(JobId, NaiveDate, String)>,
}

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub failed: Vec<(JobId, NaiveDate)>,
    pub missed: Vec<(JobId, NaiveDate)>,
    pub finished_jobs: Vec<JobId>,
}

type OccurrenceKey = (JobId, NaiveDate);

pub struct Driver {
    recorder: Recorder,
    settings: DriverSettings,

    /// Occurrences this process is recording right now
    owned: Arc<Mutex<HashSet<OccurrenceKey>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Driver {
    pub fn new(recorder: Recorder, settings: DriverSettings) -> Self {
        Self {
            recorder,
            settings,
            owned: Arc::new(Mutex::new(HashSet::new())),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn owns(&self, key: &OccurrenceKey) -> bool {
        self.owned
            .lock()
            .map(|owned| owned.contains(key))
            .unwrap_or(false)
    }

    /// Examine every active job at `now` (local time)
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: NaiveDateTime) -> Result<TickReport> {
        let settings = self
            .recorder
            .config
            .capture_settings()
            .context("Failed to read capture settings")?;
        let jobs = self
            .recorder
            .store
            .list_jobs()
            .context("Failed to list jobs")?;

        let mut report = TickReport::default();
        for job in jobs.iter().filter(|j| j.status == JobStatus::Active) {
            if let Err(e) = self.examine(job, now, &settings, &mut report).await {
                error!(job = %job.id, name = %job.name, "Job tick failed: {:#}", e);
            }
        }
        Ok(report)
    }

    async fn examine(
        &self,
        job: &Job,
        now: NaiveDateTime,
        settings: &CaptureSettings,
        report: &mut TickReport,
    ) -> Result<()> {
        // start <= now < start + duration
        let earliest = now.checked_sub_signed(job.duration()).with_context(|| {
            format!("Duration {}s puts the window out of range", job.duration_secs)
        })?;
        let window = TimeWindow::new(
            earliest + chrono::Duration::nanoseconds(1),
            now + chrono::Duration::nanoseconds(1),
        );

        for start in job.occurrences(window) {
            let date = start.date();
            let key = (job.id, date);
            if self.owns(&key) {
                continue;
            }
            if let Some(instance) = self.recorder.ledger.get_instance(job.id, date)? {
                if instance.status != InstanceStatus::Pending {
                    continue;
                }
            }

            let late = now - start;
            if late > self.settings.start_tolerance {
                let notes = format!(
                    "window already in progress ({}s late, tolerance {}s)",
                    late.num_seconds(),
                    self.settings.start_tolerance.num_seconds()
                );
                info!(job = %job.id, date = %date, "{}", notes);
                self.recorder.ledger.record_outcome(
                    job.id,
                    date,
                    InstanceStatus::Missed,
                    Outcome::default().with_notes(notes),
                )?;
                report.missed.push(key);
            } else {
                match self.trigger(job, start, now, settings).await? {
                    Ok(()) => report.triggered.push(key),
                    Err(reason) => report.failed.push((job.id, date, reason)),
                }
            }

            if !job.is_recurring() {
                self.recorder
                    .store
                    .set_job_status(job.id, JobStatus::Finished)?;
                debug!(job = %job.id, "One-time job finished");
            }
        }
        Ok(())
    }

    /// Outer error: ledger trouble. Inner error: capture did not start.
    #[instrument(skip(self, job, settings), fields(job = %job.id, name = %job.name))]
    async fn trigger(
        &self,
        job: &Job,
        start: NaiveDateTime,
        now: NaiveDateTime,
        settings: &CaptureSettings,
    ) -> Result<Result<(), String>> {
        let date = start.date();
        let ledger = &self.recorder.ledger;
        ledger.ensure_instance(job.id, date)?;

        let lanes = CaptureKind::for_job(job.capture_video);
        let admission = match self.recorder.admission.admit(
            job.duration_secs,
            job.allow_override,
            lanes,
            settings,
        ) {
            Ok(admission) => admission,
            Err(e) => {
                let reason = e.to_string();
                warn!(date = %date, reason = %reason, "Admission rejected");
                ledger.record_outcome(
                    job.id,
                    date,
                    InstanceStatus::Failed,
                    Outcome::finished(Utc::now()).with_notes(reason.clone()),
                )?;
                return Ok(Err(reason));
            }
        };

        // Capture runs until the scheduled end, even when started late
        let end = job
            .end_of(start)
            .with_context(|| format!("Window end for {} is out of range", start))?;
        let remaining = (end - now)
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_secs(1));
        let stem = job.output_stem(start);

        let audio_request = AudioRequest::from_settings(settings, stem.clone(), remaining);
        let audio = match self.recorder.audio.start(&admission, audio_request).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = format!("audio: {}", e);
                warn!(date = %date, reason = %reason, "Capture did not start");
                ledger.record_outcome(
                    job.id,
                    date,
                    InstanceStatus::Failed,
                    Outcome::finished(Utc::now()).with_notes(reason.clone()),
                )?;
                return Ok(Err(reason));
            }
        };

        let mut handles = vec![audio];
        let mut start_errors = Vec::new();
        if job.capture_video {
            let started = match VideoRequest::from_settings(settings, stem, remaining) {
                Ok(request) => self.recorder.video.start(&admission, request).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(handle) => handles.push(handle),
                // Audio keeps running without the camera
                Err(e) => {
                    warn!(date = %date, error = %e, "Video did not start");
                    start_errors.push(format!("video: {}", e));
                }
            }
        }

        let key = (job.id, date);
        if let Ok(mut owned) = self.owned.lock() {
            owned.insert(key);
        }
        ledger.record_outcome(
            job.id,
            date,
            InstanceStatus::Recording,
            Outcome::started(Utc::now()).with_notes(start_errors.join("; ")),
        )?;

        let watcher = tokio::spawn(watch_sessions(
            self.recorder.clone(),
            self.owned.clone(),
            key,
            handles,
            start_errors,
        ));
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|w| !w.is_finished());
            watchers.push(watcher);
        }
        Ok(Ok(()))
    }

    /// Reconcile the ledger after a restart
    #[instrument(skip(self))]
    pub fn recover(&self, now: NaiveDateTime) -> Result<RecoveryReport> {
        let ledger = &self.recorder.ledger;
        let store = &self.recorder.store;
        let mut report = RecoveryReport::default();

        for instance in ledger.instances_with_status(InstanceStatus::Recording)? {
            let key = (instance.job_id, instance.occurrence_date);
            if self.owns(&key) {
                continue;
            }
            warn!(job = %instance.job_id, date = %instance.occurrence_date, "Orphaned recording");
            ledger.record_outcome(
                instance.job_id,
                instance.occurrence_date,
                InstanceStatus::Failed,
                Outcome::finished(Utc::now())
                    .with_notes("capture process did not survive restart"),
            )?;
            report.failed.push(key);
        }

        for instance in ledger.instances_with_status(InstanceStatus::Pending)? {
            let key = (instance.job_id, instance.occurrence_date);
            if self.owns(&key) {
                continue;
            }
            let job = store.get_job(instance.job_id)?;
            let ended = job
                .occurrence_on(instance.occurrence_date)
                .map(|start| job.end_of(start).map_or(false, |end| end <= now))
                .unwrap_or(true);
            if ended {
                ledger.record_outcome(
                    instance.job_id,
                    instance.occurrence_date,
                    InstanceStatus::Missed,
                    Outcome::default().with_notes("never started"),
                )?;
                report.missed.push(key);
            }
        }

        // One-time jobs whose only window passed while nothing was running
        let settings = self.recorder.config.capture_settings()?;
        for job in store.list_jobs()? {
            if job.is_recurring() || job.status != JobStatus::Active {
                continue;
            }
            match job.end_of(job.start) {
                Some(end) if end <= now => {}
                _ => continue,
            }
            let date = job.start.date();
            let evidence = expected_outputs(&job, job.start, &settings, self.recorder.min_output_bytes);
            let instance = ledger.repair(job.id, date, &evidence)?;
            if instance.status == InstanceStatus::Missed {
                report.missed.push((job.id, date));
            }
            store.set_job_status(job.id, JobStatus::Finished)?;
            report.finished_jobs.push(job.id);
        }

        info!(
            failed = report.failed.len(),
            missed = report.missed.len(),
            finished = report.finished_jobs.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Tick until `shutdown` flips to true, then stop active captures
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover(Local::now().naive_local())
            .context("Startup recovery failed")?;

        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_secs = self.settings.tick.as_secs(), "Driver running");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Local::now().naive_local();
                    match self.tick_at(now).await {
                        Ok(report) if report != TickReport::default() => {
                            debug!(?report, "Tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!("Tick failed: {:#}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Driver stopping");
        self.recorder.audio.stop().await;
        self.recorder.video.stop().await;
        self.wait_idle().await;
        Ok(())
    }

    /// Wait for every outcome watcher to record its result
    pub async fn wait_idle(&self) {
        let watchers: Vec<JoinHandle<()>> = match self.watchers.lock() {
            Ok(mut watchers) => watchers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for watcher in watchers {
            if let Err(e) = watcher.await {
                error!("Outcome watcher panicked: {}", e);
            }
        }
    }
}

async fn watch_sessions(
    recorder: Recorder,
    owned: Arc<Mutex<HashSet<OccurrenceKey>>>,
    key: OccurrenceKey,
    handles: Vec<SessionHandle>,
    start_errors: Vec<String>,
) {
    let mut outcomes: Vec<SessionOutcome> = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.wait().await);
    }

    let mut problems = start_errors;
    problems.extend(
        outcomes
            .iter()
            .filter_map(|o| o.error().map(|e| format!("{}: {}", o.lane, e))),
    );
    let status = if problems.is_empty() {
        InstanceStatus::Completed
    } else {
        InstanceStatus::Failed
    };
    let notes = if problems.is_empty() {
        let files: usize = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(Vec::len)
            .sum();
        let video = outcomes.iter().any(|o| o.lane == Lane::Video);
        format!(
            "{} file(s) recorded{}",
            files,
            if video { ", video queued for transcode" } else { "" }
        )
    } else {
        problems.join("; ")
    };

    if let Err(e) = recorder.ledger.record_outcome(
        key.0,
        key.1,
        status,
        Outcome::finished(Utc::now()).with_notes(notes),
    ) {
        error!(job = %key.0, date = %key.1, "Failed to record outcome: {}", e);
    }
    if let Ok(mut owned) = owned.lock() {
        owned.remove(&key);
    }
}

/// Files an occurrence should have left behind
pub fn expected_outputs(
    job: &Job,
    start: NaiveDateTime,
    settings: &CaptureSettings,
    min_bytes: u64,
) -> OutputEvidence {
    let stem = job.output_stem(start);
    let (left, right) = audio_outputs(&settings.audio_dir, &stem, &settings.channel_suffixes);
    let mut expected: Vec<PathBuf> = vec![left, right];
    if job.capture_video {
        expected.push(processed_path(&settings.video_dir, &stem));
    }
    OutputEvidence::new(expected, min_bytes)
}
