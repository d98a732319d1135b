//! Background transcode pipeline for raw video captures.
//!
//! FIFO queue with one running task. The worker writes to `<dest>.part` and
//! only renames after ffmpeg exits cleanly and the output duration matches
//! the source. On failure or cancel the partial output is removed and the
//! raw capture stays where it was.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{CommandSpec, MediaProbe, ProcessSpawner, Stream};
use crate::config::TranscodeConfig;
use crate::error::CaptureError;

pub type TaskId = Uuid;

/// Finished tasks kept for status queries
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time view of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// 0-99 while running, 100 once verified
    pub percent: u8,

    pub state: TaskState,
    pub encoder: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelResult {
    /// Removed before it started
    Dequeued,

    /// Running process is being killed
    Cancelling,

    AlreadyFinished(TaskState),
    NotFound,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<TaskId>,
    tasks: HashMap<TaskId, TaskSnapshot>,
    running: Option<(TaskId, Option<oneshot::Sender<()>>)>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    changes: watch::Sender<u64>,
    spawner: Arc<dyn ProcessSpawner>,
    media: Arc<dyn MediaProbe>,
    ffmpeg_path: String,
    config: TranscodeConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic mid-update leaves plain data behind; keep serving it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut TaskSnapshot)) {
        if let Some(task) = self.lock().tasks.get_mut(&id) {
            f(task);
        }
        self.changes.send_modify(|v| *v += 1);
    }
}

/// Shared handle; the worker exits once the last handle is dropped
pub struct TranscodePipeline {
    inner: Arc<Inner>,
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        self.inner.notify.notify_one();
    }
}

impl TranscodePipeline {
    /// Create the pipeline and spawn its worker (needs a tokio runtime)
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        media: Arc<dyn MediaProbe>,
        ffmpeg_path: impl Into<String>,
        config: TranscodeConfig,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        let notify = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            notify: notify.clone(),
            changes,
            spawner,
            media,
            ffmpeg_path: ffmpeg_path.into(),
            config,
        });
        tokio::spawn(worker(Arc::downgrade(&inner), notify));
        Self { inner }
    }

    /// Queue `source` for re-encoding into `destination`
    pub fn enqueue(&self, source: PathBuf, destination: PathBuf) -> TaskId {
        let id = Uuid::new_v4();
        let task = TaskSnapshot {
            id,
            source,
            destination,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            percent: 0,
            state: TaskState::Queued,
            encoder: None,
            error: None,
        };
        info!(task = %id, source = %task.source.display(), "Transcode queued");
        {
            let mut state = self.inner.lock();
            state.tasks.insert(id, task);
            state.queue.push_back(id);
        }
        self.inner.changes.send_modify(|v| *v += 1);
        self.inner.notify.notify_one();
        id
    }

    pub fn progress(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.lock().tasks.get(&id).cloned()
    }

    /// All known tasks, oldest first
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self.inner.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.enqueued_at);
        tasks
    }

    pub fn cancel(&self, id: TaskId) -> CancelResult {
        let result = {
            let mut state = self.inner.lock();
            let Some(current) = state.tasks.get(&id).map(|t| t.state) else {
                return CancelResult::NotFound;
            };
            match current {
                TaskState::Queued => {
                    state.queue.retain(|queued| *queued != id);
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.state = TaskState::Cancelled;
                        task.finished_at = Some(Utc::now());
                        task.error = Some("cancelled before start".to_string());
                    }
                    CancelResult::Dequeued
                }
                TaskState::Running => {
                    if let Some((running, cancel_tx)) = state.running.as_mut() {
                        if *running == id {
                            if let Some(tx) = cancel_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    CancelResult::Cancelling
                }
                finished => CancelResult::AlreadyFinished(finished),
            }
        };
        info!(task = %id, result = ?result, "Transcode cancel");
        self.inner.changes.send_modify(|v| *v += 1);
        result
    }

    /// Wait until the task reaches a finished state
    pub async fn wait_for(&self, id: TaskId) -> Option<TaskSnapshot> {
        let mut changes = self.inner.changes.subscribe();
        loop {
            match self.progress(id) {
                Some(task) if task.state.is_finished() => return Some(task),
                Some(_) => {}
                None => return None,
            }
            if changes.changed().await.is_err() {
                return self.progress(id);
            }
        }
    }

    pub fn is_active(&self, id: TaskId) -> bool {
        self.progress(id)
            .map(|t| !t.state.is_finished())
            .unwrap_or(false)
    }
}

async fn worker(inner: Weak<Inner>, notify: Arc<Notify>) {
    loop {
        let Some(strong) = inner.upgrade() else {
            break;
        };

        let next = {
            let mut state = strong.lock();
            match state.queue.pop_front() {
                Some(id) => {
                    let (tx, rx) = oneshot::channel();
                    state.running = Some((id, Some(tx)));
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.state = TaskState::Running;
                        task.started_at = Some(Utc::now());
                    }
                    Some((id, rx))
                }
                None => None,
            }
        };

        match next {
            Some((id, cancel_rx)) => {
                run_task(&strong, id, cancel_rx).await;
                strong.lock().running = None;
                prune_history(&strong);
            }
            None => {
                // Only the handle may keep the pipeline alive while idle;
                // notify_one leaves a permit, so no wakeup is lost
                drop(strong);
                notify.notified().await;
            }
        }
    }
    debug!("Transcode worker stopped");
}

fn prune_history(inner: &Inner) {
    let mut state = inner.lock();
    let mut finished: Vec<(DateTime<Utc>, TaskId)> = state
        .tasks
        .values()
        .filter(|t| t.state.is_finished())
        .map(|t| (t.finished_at.unwrap_or(t.enqueued_at), t.id))
        .collect();
    if finished.len() <= HISTORY_LIMIT {
        return;
    }
    finished.sort();
    let excess = finished.len() - HISTORY_LIMIT;
    for (_, id) in finished.into_iter().take(excess) {
        state.tasks.remove(&id);
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Percent complete from an `out_time_us=` progress line, capped at 99
fn parse_progress(line: &str, source_secs: f64) -> Option<u8> {
    let (key, value) = line.trim().split_once('=')?;
    if key != "out_time_us" && key != "out_time_ms" {
        return None;
    }
    let micros: f64 = value.trim().parse().ok()?;
    if source_secs <= 0.0 || micros < 0.0 {
        return None;
    }
    let percent = (micros / 1_000_000.0 / source_secs * 100.0).floor();
    Some(percent.clamp(0.0, 99.0) as u8)
}

async fn run_task(inner: &Inner, id: TaskId, cancel_rx: oneshot::Receiver<()>) {
    let Some(task) = inner.lock().tasks.get(&id).cloned() else {
        return;
    };
    let part = part_path(&task.destination);

    let result = transcode(inner, &task, &part, cancel_rx).await;

    match result {
        Ok(()) => {
            if inner.config.delete_raw_after_transcode {
                if let Err(e) = std::fs::remove_file(&task.source) {
                    warn!(task = %id, error = %e, "Could not delete raw capture");
                }
            }
            info!(task = %id, destination = %task.destination.display(), "Transcode completed");
            inner.update(id, |t| {
                t.state = TaskState::Completed;
                t.percent = 100;
                t.finished_at = Some(Utc::now());
            });
        }
        Err(outcome) => {
            if part.exists() {
                if let Err(e) = std::fs::remove_file(&part) {
                    warn!(task = %id, error = %e, "Could not remove partial output");
                }
            }
            let (state, reason) = match outcome {
                TaskEnd::Cancelled => (TaskState::Cancelled, "cancelled".to_string()),
                TaskEnd::Failed(e) => (TaskState::Failed, e.to_string()),
            };
            warn!(task = %id, state = ?state, reason = %reason, "Transcode did not complete; raw kept");
            inner.update(id, |t| {
                t.state = state;
                t.finished_at = Some(Utc::now());
                t.error = Some(reason);
            });
        }
    }
}

enum TaskEnd {
    Cancelled,
    Failed(CaptureError),
}

fn failed(message: String) -> TaskEnd {
    TaskEnd::Failed(CaptureError::Transcode(message))
}

async fn transcode(
    inner: &Inner,
    task: &TaskSnapshot,
    part: &Path,
    mut cancel_rx: oneshot::Receiver<()>,
) -> Result<(), TaskEnd> {
    let id = task.id;
    if !task.source.is_file() {
        return Err(failed(format!("source {} is missing", task.source.display())));
    }
    if let Some(parent) = task.destination.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| failed(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let source_secs = inner
        .media
        .duration_secs(&task.source)
        .await
        .unwrap_or_else(|e| {
            warn!(task = %id, error = %e, "Could not probe source duration");
            None
        });

    let hardware = &inner.config.hardware_encoder;
    let encoder = match inner.media.has_encoder(hardware).await {
        Ok(true) => hardware.clone(),
        Ok(false) => inner.config.software_encoder.clone(),
        Err(e) => {
            warn!(task = %id, error = %e, "Could not list encoders");
            inner.config.software_encoder.clone()
        }
    };

    let spec = CommandSpec::new(&inner.ffmpeg_path)
        .args(["-hide_banner", "-nostats", "-y", "-i"])
        .arg(task.source.to_string_lossy())
        .args(["-c:v", encoder.as_str(), "-b:v", inner.config.bitrate.as_str()])
        .args(["-c:a", "copy", "-movflags", "+faststart"])
        .args(["-progress", "pipe:1", "-f", "mp4"])
        .output(part);

    inner.update(id, |t| t.encoder = Some(encoder.clone()));
    info!(task = %id, encoder = %encoder, "Transcode started");

    let mut process = inner
        .spawner
        .spawn(&spec)
        .await
        .map_err(|e| failed(format!("failed to start {}: {:#}", inner.ffmpeg_path, e)))?;
    let mut output = process.take_output();
    let mut last_error = None;

    let exit = loop {
        tokio::select! {
            exit = process.wait() => break exit,
            _ = &mut cancel_rx => {
                if let Err(e) = process.kill().await {
                    warn!(task = %id, error = %e, "Kill failed");
                }
                return Err(TaskEnd::Cancelled);
            }
            line = async {
                match output.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match line {
                Some(line) => match (line.stream, source_secs) {
                    (Stream::Stdout, Some(secs)) => {
                        if let Some(percent) = parse_progress(&line.text, secs) {
                            inner.update(id, |t| t.percent = t.percent.max(percent));
                        }
                    }
                    (Stream::Stderr, _) => {
                        debug!(task = %id, "{}", line.text);
                        last_error = Some(line.text);
                    }
                    _ => {}
                },
                None => output = None,
            },
        }
    };

    let exit = exit.map_err(|e| failed(format!("lost track of ffmpeg: {:#}", e)))?;
    if !exit.success() {
        return Err(failed(format!(
            "ffmpeg exited with {}{}",
            exit.code
                .map(|c| format!("code {}", c))
                .unwrap_or_else(|| "a signal".to_string()),
            last_error.map(|l| format!(": {}", l)).unwrap_or_default()
        )));
    }

    if let Some(source_secs) = source_secs {
        let output_secs = inner
            .media
            .duration_secs(part)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| failed("cannot read duration of transcoded output".to_string()))?;
        let drift = (output_secs - source_secs).abs();
        if drift > inner.config.duration_tolerance_secs {
            return Err(failed(format!(
                "duration mismatch: source {:.1}s, output {:.1}s",
                source_secs, output_secs
            )));
        }
    }

    std::fs::rename(part, &task.destination).map_err(|e| {
        failed(format!(
            "cannot move output into {}: {}",
            task.destination.display(),
            e
        ))
    })?;
    Ok(())
}
