//! Process supervision shared by both capture lanes.
//!
//! A lane runs at most one session. Its state lives in a watch cell that
//! only the lane's own start/stop and the session's monitor task write;
//! status readers never await capture I/O. Start and stop transitions are
//! serialized by an async mutex.
//!
//! The monitor task owns the child process and ends it one of three ways:
//! the process exits, the duration timer fires, or `stop()` asks. The last
//! two send a graceful stop and escalate to a kill after the grace period.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EndReason, Lane, SessionInfo, SessionOutcome, StopResult, SupervisorSettings};
use crate::adapters::{CommandSpec, ManagedProcess, OutputLine, ProcessExit, ProcessSpawner};
use crate::core::admission::Admission;
use crate::error::{AdmissionError, CaptureError};

/// Last lines of process output kept for error messages
const TAIL_LINES: usize = 5;

/// Output line collection after exit is bounded by this
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Turns a clean process end into verified outputs (or a failure)
pub(crate) type Finalizer = Box<dyn FnOnce(EndReason) -> Result<Vec<PathBuf>, CaptureError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of a lane
#[derive(Debug, Clone)]
pub struct LaneSnapshot {
    pub phase: LanePhase,
    pub session: Option<SessionInfo>,
    pub last_outcome: Option<SessionOutcome>,
}

impl LaneSnapshot {
    fn idle() -> Self {
        Self {
            phase: LanePhase::Idle,
            session: None,
            last_outcome: None,
        }
    }
}

/// Returned by a successful start; resolves to the session's outcome
#[derive(Debug)]
pub struct SessionHandle {
    pub info: SessionInfo,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    /// Wait for the session to end
    pub async fn wait(mut self) -> SessionOutcome {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| SessionOutcome {
            session_id: self.info.id,
            lane: self.info.lane,
            started_at: self.info.started_at,
            ended_at: Utc::now(),
            ended_by: EndReason::Exited,
            result: Err(CaptureError::Process(
                "supervisor ended without reporting an outcome".to_string(),
            )),
        })
    }
}

struct ActiveSession {
    stop_tx: Option<oneshot::Sender<()>>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

/// Single-flight process supervisor for one lane
pub(crate) struct LaneEngine {
    lane: Lane,
    spawner: Arc<dyn ProcessSpawner>,
    settings: SupervisorSettings,
    state: Arc<watch::Sender<LaneSnapshot>>,
    active: Mutex<Option<ActiveSession>>,
}

impl LaneEngine {
    pub fn new(lane: Lane, spawner: Arc<dyn ProcessSpawner>, settings: SupervisorSettings) -> Self {
        let (state, _) = watch::channel(LaneSnapshot::idle());
        Self {
            lane,
            spawner,
            settings,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> LaneSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LaneSnapshot> {
        self.state.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().phase != LanePhase::Idle
    }

    pub fn busy_error(&self) -> CaptureError {
        CaptureError::Concurrency(format!("{} capture already in progress", self.lane))
    }

    /// Spawn `spec` and supervise it for `duration`
    pub async fn start(
        &self,
        admission: &Admission,
        spec: CommandSpec,
        duration: Duration,
        finalize: Finalizer,
    ) -> Result<SessionHandle, CaptureError> {
        if !admission.covers(self.lane) {
            return Err(AdmissionError::NotCovered(format!(
                "{} lane was not admitted",
                self.lane
            ))
            .into());
        }
        if duration > Duration::from_secs(admission.duration_secs()) {
            return Err(AdmissionError::NotCovered(format!(
                "requested {}s but admitted {}s",
                duration.as_secs(),
                admission.duration_secs()
            ))
            .into());
        }

        let mut active = self.active.lock().await;
        if self.is_busy() {
            return Err(self.busy_error());
        }
        self.state.send_modify(|s| {
            s.phase = LanePhase::Starting;
            s.session = None;
        });

        debug!(lane = %self.lane, command = %spec.display(), "Starting capture");
        let mut process = match timeout(self.settings.start_timeout, self.spawner.spawn(&spec)).await {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => {
                self.state.send_modify(|s| s.phase = LanePhase::Idle);
                return Err(CaptureError::Process(format!(
                    "failed to start {}: {:#}",
                    spec.program, e
                )));
            }
            Err(_) => {
                self.state.send_modify(|s| s.phase = LanePhase::Idle);
                return Err(CaptureError::Process(format!(
                    "{} did not start within {}",
                    spec.program,
                    format_duration(self.settings.start_timeout)
                )));
            }
        };

        let info = SessionInfo {
            id: Uuid::new_v4(),
            lane: self.lane,
            started_at: Utc::now(),
            duration,
            outputs: spec.outputs.clone(),
            pid: process.id(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let tail = collect_output(process.take_output(), self.lane);

        self.state.send_modify(|s| {
            s.phase = LanePhase::Running;
            s.session = Some(info.clone());
        });
        info!(
            lane = %self.lane,
            session = %info.id,
            pid = ?info.pid,
            duration_secs = duration.as_secs(),
            "Capture started"
        );

        tokio::spawn(monitor(Monitor {
            info: info.clone(),
            program: spec.program,
            process,
            stop_rx,
            outcome_tx,
            tail,
            state: self.state.clone(),
            grace: self.settings.stop_grace,
            finalize,
        }));

        *active = Some(ActiveSession {
            stop_tx: Some(stop_tx),
            outcome: outcome_rx.clone(),
        });

        Ok(SessionHandle {
            info,
            outcome: outcome_rx,
        })
    }

    /// Stop the running session and wait for its outcome
    pub async fn stop(&self) -> StopResult {
        let mut active = self.active.lock().await;
        if !matches!(
            self.state.borrow().phase,
            LanePhase::Running | LanePhase::Stopping
        ) {
            return StopResult::NothingInProgress;
        }
        let Some(session) = active.as_mut() else {
            return StopResult::NothingInProgress;
        };

        if let Some(stop_tx) = session.stop_tx.take() {
            info!(lane = %self.lane, "Stop requested");
            // The monitor may have just finished on its own
            let _ = stop_tx.send(());
        }

        let mut outcome = session.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match result {
            Some(outcome) => StopResult::Stopped(outcome),
            None => StopResult::NothingInProgress,
        }
    }
}

struct Monitor {
    info: SessionInfo,
    program: String,
    process: Box<dyn ManagedProcess>,
    stop_rx: oneshot::Receiver<()>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    tail: JoinHandle<Vec<String>>,
    state: Arc<watch::Sender<LaneSnapshot>>,
    grace: Duration,
    finalize: Finalizer,
}

enum FirstEvent {
    Exited(anyhow::Result<ProcessExit>),
    Stop(EndReason),
}

async fn monitor(ctx: Monitor) {
    let Monitor {
        info,
        program,
        mut process,
        mut stop_rx,
        outcome_tx,
        tail,
        state,
        grace,
        finalize,
    } = ctx;

    let deadline = tokio::time::sleep(info.duration);
    tokio::pin!(deadline);

    let first = tokio::select! {
        exit = process.wait() => FirstEvent::Exited(exit),
        _ = &mut deadline => FirstEvent::Stop(EndReason::DurationReached),
        _ = &mut stop_rx => FirstEvent::Stop(EndReason::StopRequested),
    };

    let (ended_by, exit) = match first {
        FirstEvent::Exited(exit) => (EndReason::Exited, exit),
        FirstEvent::Stop(reason) => {
            state.send_modify(|s| s.phase = LanePhase::Stopping);
            debug!(lane = %info.lane, reason = %reason, "Requesting graceful stop");
            if let Err(e) = process.request_stop().await {
                warn!(lane = %info.lane, error = %e, "Graceful stop request failed");
            }
            match timeout(grace, process.wait()).await {
                Ok(exit) => (reason, exit),
                Err(_) => {
                    warn!(
                        lane = %info.lane,
                        grace = %format_duration(grace),
                        "Process ignored stop request, killing"
                    );
                    if let Err(e) = process.kill().await {
                        warn!(lane = %info.lane, error = %e, "Kill failed");
                    }
                    (EndReason::ForceKilled, Ok(ProcessExit { code: None }))
                }
            }
        }
    };

    let tail = timeout(OUTPUT_DRAIN, tail)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

    let result = match (ended_by, exit) {
        (EndReason::ForceKilled, _) => Err(CaptureError::Process(format!(
            "force-killed after {} grace",
            format_duration(grace)
        ))),
        (_, Err(e)) => Err(CaptureError::Process(format!(
            "lost track of {}: {:#}",
            program, e
        ))),
        (EndReason::Exited, Ok(exit)) if !exit.success() => Err(CaptureError::Process(format!(
            "{} exited with {}{}",
            program,
            exit.code
                .map(|c| format!("code {}", c))
                .unwrap_or_else(|| "a signal".to_string()),
            tail.last().map(|l| format!(": {}", l)).unwrap_or_default()
        ))),
        (reason, Ok(_)) => finalize(reason),
    };

    let outcome = SessionOutcome {
        session_id: info.id,
        lane: info.lane,
        started_at: info.started_at,
        ended_at: Utc::now(),
        ended_by,
        result,
    };
    match &outcome.result {
        Ok(files) => info!(
            lane = %info.lane,
            session = %info.id,
            ended_by = %ended_by,
            files = files.len(),
            "Capture finished"
        ),
        Err(e) => warn!(
            lane = %info.lane,
            session = %info.id,
            ended_by = %ended_by,
            error = %e,
            "Capture failed"
        ),
    }

    // Idle before the outcome is visible, so a waiter can start again at once
    state.send_modify(|s| {
        s.phase = LanePhase::Idle;
        s.session = None;
        s.last_outcome = Some(outcome.clone());
    });
    let _ = outcome_tx.send(Some(outcome));
}

fn collect_output(
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
    lane: Lane,
) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        if let Some(mut output) = output {
            while let Some(line) = output.recv().await {
                debug!(lane = %lane, "{}", line.text);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.text);
            }
        }
        tail.into()
    })
}

/// "10s", or milliseconds for sub-second values
pub(crate) fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
