//! Fakes for the host adapters used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use recdeck::adapters::{
    CommandSpec, Device, DeviceEnumerator, ManagedProcess, MediaProbe, OutputLine, ProcessExit,
    ProcessSpawner, Stream, VolumeProbe,
};
use recdeck::capture::{DeviceSelector, SupervisorSettings};
use recdeck::config::{CaptureSettings, ConfigSource, ResolvedConfig, StoreConfigSource};
use recdeck::core::{Host, Recorder, Store};

// ============================================================================
// Processes
// ============================================================================

/// How a fake process behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Runs until `exit_after` (forever when None) or a stop request, then
    /// writes `bytes` to every output and exits. A natural end exits with
    /// `exit_code`, a requested stop with 0.
    Record {
        bytes: usize,
        exit_after: Option<Duration>,
        exit_code: i32,
        stdout: Vec<String>,
    },

    /// Never honours a stop request; only a kill ends it
    IgnoreStop,

    /// Spawning fails
    FailSpawn(String),
}

impl Behavior {
    /// Writes outputs and exits 0 after `after`
    pub fn finishes_after(after: Duration, bytes: usize) -> Self {
        Self::Record {
            bytes,
            exit_after: Some(after),
            exit_code: 0,
            stdout: Vec::new(),
        }
    }

    /// Runs until stopped
    pub fn until_stopped(bytes: usize) -> Self {
        Self::Record {
            bytes,
            exit_after: None,
            exit_code: 0,
            stdout: Vec::new(),
        }
    }

    /// Exits with `code` after `after` without writing anything
    pub fn crashes_after(after: Duration, code: i32) -> Self {
        Self::Record {
            bytes: 0,
            exit_after: Some(after),
            exit_code: code,
            stdout: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Signal {
    Stop,
    Kill,
}

pub struct FakeSpawner {
    default: Behavior,
    queued: Mutex<VecDeque<Behavior>>,
    specs: Mutex<Vec<CommandSpec>>,
}

impl FakeSpawner {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            queued: Mutex::new(VecDeque::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// Use `behavior` for the next spawn only
    pub fn push(&self, behavior: Behavior) {
        self.queued.lock().unwrap().push_back(behavior);
    }

    /// Every command spawned so far
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        self.specs.lock().unwrap().push(spec.clone());
        let behavior = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Behavior::FailSpawn(message) = behavior {
            anyhow::bail!(message);
        }
        Ok(Box::new(FakeProcess::start(behavior, spec.outputs.clone())))
    }
}

pub struct FakeProcess {
    signals: mpsc::UnboundedSender<Signal>,
    exit: watch::Receiver<Option<ProcessExit>>,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

impl FakeProcess {
    fn start(behavior: Behavior, outputs: Vec<PathBuf>) -> Self {
        let (signals, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit) = watch::channel(None);
        let (out_tx, output) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let code = match behavior {
                Behavior::Record {
                    bytes,
                    exit_after,
                    exit_code,
                    stdout,
                } => {
                    for text in stdout {
                        let _ = out_tx.send(OutputLine {
                            stream: Stream::Stdout,
                            text,
                        });
                    }
                    let signal = match exit_after {
                        Some(after) => tokio::select! {
                            _ = tokio::time::sleep(after) => None,
                            signal = signal_rx.recv() => Some(signal),
                        },
                        None => Some(signal_rx.recv().await),
                    };
                    match signal {
                        None => {
                            write_outputs(&outputs, bytes);
                            if exit_code != 0 {
                                let _ = out_tx.send(OutputLine {
                                    stream: Stream::Stderr,
                                    text: "Input/output error".to_string(),
                                });
                            }
                            Some(exit_code)
                        }
                        Some(Some(Signal::Stop)) => {
                            write_outputs(&outputs, bytes);
                            Some(0)
                        }
                        Some(Some(Signal::Kill)) | Some(None) => None,
                    }
                }
                Behavior::IgnoreStop => {
                    while let Some(signal) = signal_rx.recv().await {
                        if matches!(signal, Signal::Kill) {
                            break;
                        }
                    }
                    None
                }
                Behavior::FailSpawn(_) => Some(1),
            };
            drop(out_tx);
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        Self {
            signals,
            exit,
            output: Some(output),
        }
    }
}

fn write_outputs(outputs: &[PathBuf], bytes: usize) {
    for path in outputs {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(path, vec![0u8; bytes]);
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn request_stop(&mut self) -> Result<()> {
        let _ = self.signals.send(Signal::Stop);
        Ok(())
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        let exit = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("fake process vanished"))?;
        Ok((*exit).unwrap_or(ProcessExit { code: None }))
    }

    async fn kill(&mut self) -> Result<()> {
        let _ = self.signals.send(Signal::Kill);
        self.wait().await.map(|_| ())
    }

    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }
}

// ============================================================================
// Devices, volumes, media
// ============================================================================

pub struct FakeDevices {
    devices: Mutex<Vec<Device>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeDevices {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn usb_codec() -> Self {
        Self::new(vec![
            device(0, "bcm2835 Headphones"),
            device(1, "USB Audio CODEC"),
        ])
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// How many times the device list was read
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn device(index: u32, name: &str) -> Device {
    Device {
        index,
        device: format!("hw:{}", index),
        name: name.to_string(),
        capabilities: vec!["capture".to_string()],
    }
}

#[async_trait]
impl DeviceEnumerator for FakeDevices {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("arecord: no soundcards found");
        }
        Ok(self.devices.lock().unwrap().clone())
    }
}

/// One volume holding every path
pub struct FakeVolumes {
    free: AtomicU64,
    mounted: AtomicBool,
}

impl FakeVolumes {
    pub fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
            mounted: AtomicBool::new(true),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }

    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }
}

impl VolumeProbe for FakeVolumes {
    fn free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }

    fn volume_id(&self, _path: &Path) -> Result<u64> {
        Ok(1)
    }

    fn is_mount_point(&self, _path: &Path) -> Result<bool> {
        Ok(self.mounted.load(Ordering::SeqCst))
    }
}

pub struct FakeMedia {
    default_duration: Option<f64>,
    durations: Mutex<HashMap<PathBuf, f64>>,
    encoders: Vec<String>,
}

impl FakeMedia {
    /// Every file reports `default_duration`; only `encoders` are available
    pub fn new(default_duration: Option<f64>, encoders: &[&str]) -> Self {
        Self {
            default_duration,
            durations: Mutex::new(HashMap::new()),
            encoders: encoders.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn set_duration(&self, path: &Path, secs: f64) {
        self.durations
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), secs);
    }
}

#[async_trait]
impl MediaProbe for FakeMedia {
    async fn duration_secs(&self, path: &Path) -> Result<Option<f64>> {
        Ok(self
            .durations
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .or(self.default_duration))
    }

    async fn has_encoder(&self, encoder: &str) -> Result<bool> {
        Ok(self.encoders.iter().any(|e| e == encoder))
    }
}

// ============================================================================
// Rig
// ============================================================================

pub const TB: u64 = 1 << 40;

/// Supervisor timings short enough for tests
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        ffmpeg_path: "ffmpeg".to_string(),
        start_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_millis(200),
        min_output_bytes: 4096,
    }
}

/// Capture settings rooted in a temp dir
pub fn capture_settings(root: &Path) -> CaptureSettings {
    let video_dir = root.join("video");
    std::fs::create_dir_all(&video_dir).unwrap();
    CaptureSettings {
        audio_device: DeviceSelector::Auto,
        fallback_device: "hw:1".to_string(),
        audio_dir: root.join("recordings"),
        video_dir,
        require_mount: true,
        stream_url: Some("rtsp://10.0.0.5/1".to_string()),
        channel_suffixes: ("A".to_string(), "B".to_string()),
    }
}

/// A recorder over an in-memory store and fake host adapters
pub struct Rig {
    pub temp: TempDir,
    pub settings: CaptureSettings,
    pub spawner: Arc<FakeSpawner>,
    pub devices: Arc<FakeDevices>,
    pub volumes: Arc<FakeVolumes>,
    pub media: Arc<FakeMedia>,
    pub recorder: Recorder,
}

impl Rig {
    /// Capture settings fixed for the life of the rig
    pub fn new(default: Behavior) -> Self {
        Self::build(default, false)
    }

    /// Capture settings overlaid from the store's `system_config` table
    pub fn with_store_config(default: Behavior) -> Self {
        Self::build(default, true)
    }

    fn build(default: Behavior, store_config: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let settings = capture_settings(temp.path());
        let spawner = Arc::new(FakeSpawner::new(default));
        let devices = Arc::new(FakeDevices::usb_codec());
        let volumes = Arc::new(FakeVolumes::new(TB));
        let media = Arc::new(FakeMedia::new(Some(60.0), &["h264_v4l2m2m"]));

        let host = Host {
            spawner: spawner.clone(),
            devices: devices.clone(),
            volumes: volumes.clone(),
            media: media.clone(),
        };
        let mut resolved = ResolvedConfig::rooted_at(temp.path());
        resolved.capture.stop_grace_secs = 1;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config: Arc<dyn ConfigSource> = if store_config {
            Arc::new(StoreConfigSource::new(store.clone(), settings.clone()))
        } else {
            Arc::new(settings.clone())
        };
        let recorder = Recorder::assemble(store, config, host, &resolved);

        Self {
            temp,
            settings,
            spawner,
            devices,
            volumes,
            media,
            recorder,
        }
    }
}
