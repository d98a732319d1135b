//! Adapter interfaces for the host system.
//!
//! Capture code never touches processes, sound cards or filesystem
//! statistics directly; it goes through these traits so tests can swap in
//! fakes. The real implementations shell out to ffmpeg/ffprobe/arecord and
//! read volume statistics.

pub mod alsa;
pub mod ffprobe;
pub mod process;
pub mod volume;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use alsa::ArecordEnumerator;
pub use ffprobe::FfprobeMedia;
pub use process::TokioSpawner;
pub use volume::HostVolumes;

/// A command to run under supervision
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Binary name or path
    pub program: String,

    pub args: Vec<String>,

    /// Files the command is expected to write
    pub outputs: Vec<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an output path as an argument and remember it
    pub fn output(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self.outputs.push(path.to_path_buf());
        self
    }

    /// Shell-ish rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, None when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A line of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// A running child process
#[async_trait]
pub trait ManagedProcess: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Ask the process to finish cleanly (ffmpeg: `q` on stdin)
    async fn request_stop(&mut self) -> Result<()>;

    /// Wait for exit. Cancel-safe: dropping the future leaves the process
    /// running and a later call resumes waiting.
    async fn wait(&mut self) -> Result<ProcessExit>;

    /// Terminate immediately
    async fn kill(&mut self) -> Result<()>;

    /// Output lines, available once
    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>>;
}

/// Spawns supervised processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>>;
}

/// A capture-capable sound device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Card index
    pub index: u32,

    /// ALSA identifier, e.g. "hw:1"
    pub device: String,

    /// Human-readable card name
    pub name: String,

    /// Free-form tags ("capture", "usb", ...)
    pub capabilities: Vec<String>,
}

impl Device {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Lists capture devices
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;
}

/// Filesystem statistics
pub trait VolumeProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the volume holding `path`
    fn free_bytes(&self, path: &Path) -> Result<u64>;

    /// Opaque identifier of the volume holding `path`
    fn volume_id(&self, path: &Path) -> Result<u64>;

    /// Whether `path` is the root of a mounted filesystem
    fn is_mount_point(&self, path: &Path) -> Result<bool>;
}

/// Media inspection
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Container duration in seconds, None when unreadable
    async fn duration_secs(&self, path: &Path) -> Result<Option<f64>>;

    /// Whether ffmpeg was built with `encoder`
    async fn has_encoder(&self, encoder: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("ffmpeg")
            .args(["-y", "-i", "in.mp4"])
            .output(Path::new("/tmp/out.mp4"));

        assert_eq!(spec.args, vec!["-y", "-i", "in.mp4", "/tmp/out.mp4"]);
        assert_eq!(spec.outputs, vec![PathBuf::from("/tmp/out.mp4")]);
        assert_eq!(spec.display(), "ffmpeg -y -i in.mp4 /tmp/out.mp4");
    }

    #[test]
    fn test_exit_success() {
        assert!(ProcessExit { code: Some(0) }.success());
        assert!(!ProcessExit { code: Some(255) }.success());
        assert!(!ProcessExit { code: None }.success());
    }
}
