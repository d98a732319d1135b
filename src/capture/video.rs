//! RTSP video capture.
//!
//! The camera stream is copied without re-encoding into `raw/<stem>.mp4`
//! under the storage root. When the capture ends cleanly the raw file is
//! handed to the transcode pipeline, which writes
//! `processed/<stem>_compressed.mp4`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument};

use super::lane::{LaneEngine, LanePhase, SessionHandle};
use super::transcode::{TaskId, TaskSnapshot, TranscodePipeline};
use super::{EndReason, Lane, SessionInfo, SessionOutcome, StopResult, SupervisorSettings};
use crate::adapters::{CommandSpec, ProcessSpawner, VolumeProbe};
use crate::config::CaptureSettings;
use crate::core::admission::Admission;
use crate::error::CaptureError;

pub const RAW_DIR: &str = "raw";
pub const PROCESSED_DIR: &str = "processed";

const WRITE_PROBE: &str = ".recdeck_write_test";

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub stream_url: String,

    /// Holds raw/ and processed/
    pub storage_root: PathBuf,

    pub stem: String,
    pub duration: Duration,

    /// Refuse a storage root that is not a mounted volume
    pub require_mount: bool,
}

impl VideoRequest {
    pub fn from_settings(
        settings: &CaptureSettings,
        stem: impl Into<String>,
        duration: Duration,
    ) -> Result<Self, CaptureError> {
        let stream_url = settings
            .stream_url
            .clone()
            .ok_or_else(|| CaptureError::Device("camera stream is not configured".to_string()))?;
        Ok(Self {
            stream_url,
            storage_root: settings.video_dir.clone(),
            stem: stem.into(),
            duration,
            require_mount: settings.require_mount,
        })
    }

    pub fn raw_path(&self) -> PathBuf {
        raw_path(&self.storage_root, &self.stem)
    }

    pub fn processed_path(&self) -> PathBuf {
        processed_path(&self.storage_root, &self.stem)
    }
}

pub fn raw_path(root: &Path, stem: &str) -> PathBuf {
    root.join(RAW_DIR).join(format!("{}.mp4", stem))
}

pub fn processed_path(root: &Path, stem: &str) -> PathBuf {
    root.join(PROCESSED_DIR)
        .join(format!("{}_compressed.mp4", stem))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    Idle,
    CapturingRaw,
    Stopping,

    /// Raw capture done, its transcode still queued or running
    Transcoding,
}

#[derive(Debug, Clone)]
pub struct VideoStatus {
    pub state: VideoState,
    pub session: Option<SessionInfo>,
    pub last_outcome: Option<SessionOutcome>,
    pub transcode: Option<TaskSnapshot>,
}

/// Owns the video lane
pub struct VideoSupervisor {
    engine: LaneEngine,
    volumes: Arc<dyn VolumeProbe>,
    pipeline: Arc<TranscodePipeline>,
    last_task: Arc<Mutex<Option<TaskId>>>,
}

impl VideoSupervisor {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        volumes: Arc<dyn VolumeProbe>,
        pipeline: Arc<TranscodePipeline>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            engine: LaneEngine::new(Lane::Video, spawner, settings),
            volumes,
            pipeline,
            last_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn pipeline(&self) -> &Arc<TranscodePipeline> {
        &self.pipeline
    }

    /// Start a raw capture; rejects while another video session is active
    #[instrument(skip_all, fields(stem = %request.stem))]
    pub async fn start(
        &self,
        admission: &Admission,
        request: VideoRequest,
    ) -> Result<SessionHandle, CaptureError> {
        if self.engine.is_busy() {
            return Err(self.engine.busy_error());
        }

        self.prepare_storage(&request.storage_root, request.require_mount)?;

        let raw = request.raw_path();
        let processed = request.processed_path();
        let spec = build_command(
            &self.engine.settings().ffmpeg_path,
            &request.stream_url,
            request.duration,
            &raw,
        );

        let pipeline = self.pipeline.clone();
        let last_task = self.last_task.clone();
        let finalize = Box::new(move |_: EndReason| {
            let size = std::fs::metadata(&raw).map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                return Err(CaptureError::Process(format!(
                    "raw capture {} is empty",
                    raw.display()
                )));
            }
            let task = pipeline.enqueue(raw.clone(), processed);
            if let Ok(mut last) = last_task.lock() {
                *last = Some(task);
            }
            Ok(vec![raw])
        });

        self.engine
            .start(admission, spec, request.duration, finalize)
            .await
    }

    /// Stop the raw capture (the moov atom is written on a graceful stop)
    pub async fn stop(&self) -> StopResult {
        self.engine.stop().await
    }

    pub fn status(&self) -> VideoStatus {
        let snapshot = self.engine.snapshot();
        let transcode = self
            .last_task
            .lock()
            .ok()
            .and_then(|last| *last)
            .and_then(|id| self.pipeline.progress(id));

        let state = match snapshot.phase {
            LanePhase::Starting | LanePhase::Running => VideoState::CapturingRaw,
            LanePhase::Stopping => VideoState::Stopping,
            LanePhase::Idle => match &transcode {
                Some(task) if !task.state.is_finished() => VideoState::Transcoding,
                _ => VideoState::Idle,
            },
        };

        VideoStatus {
            state,
            session: snapshot.session,
            last_outcome: snapshot.last_outcome,
            transcode,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.engine.is_busy()
    }

    /// Storage root must exist, be a directory, be mounted if required,
    /// and accept writes
    fn prepare_storage(&self, root: &Path, require_mount: bool) -> Result<(), CaptureError> {
        if !root.exists() {
            return Err(CaptureError::Storage(format!(
                "{} does not exist",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(CaptureError::Storage(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        if require_mount {
            let mounted = self.volumes.is_mount_point(root).map_err(|e| {
                CaptureError::Storage(format!("cannot check mount at {}: {:#}", root.display(), e))
            })?;
            if !mounted {
                return Err(CaptureError::Storage(format!(
                    "{} is not a mounted volume",
                    root.display()
                )));
            }
        }

        for dir in [RAW_DIR, PROCESSED_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                CaptureError::Storage(format!("cannot create {}: {}", path.display(), e))
            })?;
        }

        let probe = root.join(WRITE_PROBE);
        std::fs::write(&probe, b"ok").map_err(|e| {
            CaptureError::Storage(format!("{} is not writable: {}", root.display(), e))
        })?;
        let _ = std::fs::remove_file(&probe);

        info!(root = %root.display(), "Video storage ready");
        Ok(())
    }
}

fn build_command(ffmpeg: &str, url: &str, duration: Duration, raw: &Path) -> CommandSpec {
    CommandSpec::new(ffmpeg)
        .args(["-hide_banner", "-nostats", "-y"])
        .args(["-rtsp_transport", "tcp", "-i", url])
        .args(["-c", "copy", "-map", "0", "-movflags", "+faststart"])
        .args(["-t".to_string(), format!("{}", duration.as_secs_f64())])
        .output(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let root = Path::new("/mnt/usb_recorder");
        assert_eq!(
            raw_path(root, "Service_20261004_1000"),
            PathBuf::from("/mnt/usb_recorder/raw/Service_20261004_1000.mp4")
        );
        assert_eq!(
            processed_path(root, "Service_20261004_1000"),
            PathBuf::from("/mnt/usb_recorder/processed/Service_20261004_1000_compressed.mp4")
        );
    }

    #[test]
    fn test_command_layout() {
        let spec = build_command(
            "ffmpeg",
            "rtsp://10.0.0.5/1",
            Duration::from_secs(3600),
            Path::new("/mnt/usb/raw/take.mp4"),
        );
        assert_eq!(
            spec.display(),
            "ffmpeg -hide_banner -nostats -y -rtsp_transport tcp -i rtsp://10.0.0.5/1 \
             -c copy -map 0 -movflags +faststart -t 3600 /mnt/usb/raw/take.mp4"
        );
    }
}
