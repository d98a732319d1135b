//! Dual-mono audio capture.
//!
//! One ffmpeg process reads the stereo ALSA input and splits it into two
//! mono 48 kHz 16-bit WAV files, one per channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::instrument;

use super::devices::{resolve_device, DeviceSelector};
use super::lane::{LaneEngine, LanePhase, SessionHandle};
use super::{EndReason, Lane, SessionInfo, SessionOutcome, StopResult, SupervisorSettings};
use crate::adapters::{CommandSpec, DeviceEnumerator, ProcessSpawner};
use crate::config::CaptureSettings;
use crate::core::admission::Admission;
use crate::error::CaptureError;

/// What to record
#[derive(Debug, Clone)]
pub struct AudioRequest {
    pub device: DeviceSelector,

    /// Used when `auto` finds nothing recognizable
    pub fallback_device: String,

    pub duration: Duration,
    pub output_dir: PathBuf,
    pub stem: String,

    /// Left and right filename suffixes
    pub suffixes: (String, String),
}

impl AudioRequest {
    pub fn from_settings(settings: &CaptureSettings, stem: impl Into<String>, duration: Duration) -> Self {
        Self {
            device: settings.audio_device.clone(),
            fallback_device: settings.fallback_device.clone(),
            duration,
            output_dir: settings.audio_dir.clone(),
            stem: stem.into(),
            suffixes: settings.channel_suffixes.clone(),
        }
    }

    /// Left and right output paths
    pub fn outputs(&self) -> (PathBuf, PathBuf) {
        audio_outputs(&self.output_dir, &self.stem, &self.suffixes)
    }
}

/// `<dir>/<stem>_<left>.wav` and `<dir>/<stem>_<right>.wav`
pub fn audio_outputs(dir: &Path, stem: &str, suffixes: &(String, String)) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}_{}.wav", stem, suffixes.0)),
        dir.join(format!("{}_{}.wav", stem, suffixes.1)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioState {
    Idle,
    Starting,
    Recording,
    Stopping,

    /// Idle after a failed session
    Failed,
}

#[derive(Debug, Clone)]
pub struct AudioStatus {
    pub state: AudioState,
    pub session: Option<SessionInfo>,
    pub last_outcome: Option<SessionOutcome>,
}

/// Owns the audio lane
pub struct AudioSupervisor {
    engine: LaneEngine,
    devices: Arc<dyn DeviceEnumerator>,
}

impl AudioSupervisor {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        devices: Arc<dyn DeviceEnumerator>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            engine: LaneEngine::new(Lane::Audio, spawner, settings),
            devices,
        }
    }

    /// Start recording; rejects while another audio session is active
    #[instrument(skip_all, fields(stem = %request.stem))]
    pub async fn start(
        &self,
        admission: &Admission,
        request: AudioRequest,
    ) -> Result<SessionHandle, CaptureError> {
        if self.engine.is_busy() {
            return Err(self.engine.busy_error());
        }

        let device = resolve_device(
            self.devices.as_ref(),
            &request.device,
            &request.fallback_device,
        )
        .await?;

        std::fs::create_dir_all(&request.output_dir).map_err(|e| {
            CaptureError::Storage(format!(
                "cannot create {}: {}",
                request.output_dir.display(),
                e
            ))
        })?;

        let (left, right) = request.outputs();
        let spec = build_command(
            &self.engine.settings().ffmpeg_path,
            &device,
            request.duration,
            &left,
            &right,
        );

        let min_bytes = self.engine.settings().min_output_bytes;
        let finalize = Box::new(move |_: EndReason| verify_outputs(&[left, right], min_bytes));

        self.engine
            .start(admission, spec, request.duration, finalize)
            .await
    }

    /// Stop the active session; `NothingInProgress` when idle
    pub async fn stop(&self) -> StopResult {
        self.engine.stop().await
    }

    pub fn status(&self) -> AudioStatus {
        let snapshot = self.engine.snapshot();
        let state = match snapshot.phase {
            LanePhase::Starting => AudioState::Starting,
            LanePhase::Running => AudioState::Recording,
            LanePhase::Stopping => AudioState::Stopping,
            LanePhase::Idle => match &snapshot.last_outcome {
                Some(outcome) if !outcome.is_success() => AudioState::Failed,
                _ => AudioState::Idle,
            },
        };
        AudioStatus {
            state,
            session: snapshot.session,
            last_outcome: snapshot.last_outcome,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.engine.is_busy()
    }
}

fn build_command(ffmpeg: &str, device: &str, duration: Duration, left: &Path, right: &Path) -> CommandSpec {
    let secs = duration.as_secs_f64();
    CommandSpec::new(ffmpeg)
        .args(["-hide_banner", "-nostats", "-y"])
        .args(["-f", "alsa", "-i", device])
        .args(["-t".to_string(), format!("{}", secs)])
        .args([
            "-filter_complex",
            "[0:a]channelsplit=channel_layout=stereo[left][right]",
        ])
        .args(["-map", "[left]", "-acodec", "pcm_s16le", "-ar", "48000"])
        .output(left)
        .args(["-map", "[right]", "-acodec", "pcm_s16le", "-ar", "48000"])
        .output(right)
}

/// Each file must exist and be larger than `min_bytes`
fn verify_outputs(paths: &[PathBuf], min_bytes: u64) -> Result<Vec<PathBuf>, CaptureError> {
    for path in paths {
        let size = std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|_| CaptureError::Process(format!("output {} was not written", path.display())))?;
        if size <= min_bytes {
            return Err(CaptureError::Process(format!(
                "output {} is only {} bytes",
                path.display(),
                size
            )));
        }
    }
    Ok(paths.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_command_layout() {
        let spec = build_command(
            "ffmpeg",
            "hw:1",
            Duration::from_secs(5400),
            Path::new("/rec/take_A.wav"),
            Path::new("/rec/take_B.wav"),
        );
        let line = spec.display();
        assert!(line.contains("-f alsa -i hw:1 -t 5400"));
        assert!(line.contains("channelsplit=channel_layout=stereo[left][right]"));
        assert!(line.contains("-map [left] -acodec pcm_s16le -ar 48000 /rec/take_A.wav"));
        assert!(line.ends_with("-map [right] -acodec pcm_s16le -ar 48000 /rec/take_B.wav"));
        assert_eq!(spec.outputs.len(), 2);
    }

    #[test]
    fn test_output_names() {
        let (a, b) = audio_outputs(
            Path::new("/rec"),
            "Choir_20261004_1900",
            &("A".to_string(), "B".to_string()),
        );
        assert_eq!(a, PathBuf::from("/rec/Choir_20261004_1900_A.wav"));
        assert_eq!(b, PathBuf::from("/rec/Choir_20261004_1900_B.wav"));
    }

    #[test]
    fn test_verify_outputs() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.wav");
        let b = temp.path().join("b.wav");
        std::fs::write(&a, vec![0u8; 5000]).unwrap();

        let missing = verify_outputs(&[a.clone(), b.clone()], 4096).unwrap_err();
        assert!(missing.to_string().contains("was not written"));

        std::fs::write(&b, vec![0u8; 44]).unwrap();
        let small = verify_outputs(&[a.clone(), b.clone()], 4096).unwrap_err();
        assert!(small.to_string().contains("only 44 bytes"));

        std::fs::write(&b, vec![0u8; 5000]).unwrap();
        assert_eq!(verify_outputs(&[a.clone(), b.clone()], 4096).unwrap(), vec![a, b]);
    }
}
