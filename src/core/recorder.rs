//! Wiring of the capture system.
//!
//! A [`Recorder`] holds one of each component. The driver and the control
//! surface share it, so scheduled and manual captures go through the same
//! supervisors and the single-flight rule holds across both.

use std::sync::Arc;

use crate::adapters::{
    ArecordEnumerator, DeviceEnumerator, FfprobeMedia, HostVolumes, MediaProbe, ProcessSpawner,
    TokioSpawner, VolumeProbe,
};
use crate::capture::{AudioSupervisor, SupervisorSettings, TranscodePipeline, VideoSupervisor};
use crate::config::{ConfigSource, ResolvedConfig};

use super::admission::AdmissionController;
use super::ledger::Ledger;
use super::store::Store;

/// Host adapters
#[derive(Clone)]
pub struct Host {
    pub spawner: Arc<dyn ProcessSpawner>,
    pub devices: Arc<dyn DeviceEnumerator>,
    pub volumes: Arc<dyn VolumeProbe>,
    pub media: Arc<dyn MediaProbe>,
}

impl Host {
    /// Real processes, `arecord`, ffprobe and the local filesystem
    pub fn system(ffmpeg_path: &str) -> Self {
        Self {
            spawner: Arc::new(TokioSpawner::new()),
            devices: Arc::new(ArecordEnumerator::new()),
            volumes: Arc::new(HostVolumes::new()),
            media: Arc::new(FfprobeMedia::new(ffmpeg_path)),
        }
    }
}

#[derive(Clone)]
pub struct Recorder {
    pub store: Arc<Store>,
    pub ledger: Ledger,
    pub admission: Arc<AdmissionController>,
    pub audio: Arc<AudioSupervisor>,
    pub video: Arc<VideoSupervisor>,
    pub pipeline: Arc<TranscodePipeline>,
    pub host: Host,
    pub config: Arc<dyn ConfigSource>,

    /// Output size below which a file counts as absent
    pub min_output_bytes: u64,
}

impl Recorder {
    /// Build every component (spawns the transcode worker)
    pub fn assemble(
        store: Arc<Store>,
        config: Arc<dyn ConfigSource>,
        host: Host,
        resolved: &ResolvedConfig,
    ) -> Self {
        let supervisor = SupervisorSettings::from(&resolved.capture);
        let pipeline = Arc::new(TranscodePipeline::new(
            host.spawner.clone(),
            host.media.clone(),
            supervisor.ffmpeg_path.clone(),
            resolved.transcode.clone(),
        ));
        let audio = Arc::new(AudioSupervisor::new(
            host.spawner.clone(),
            host.devices.clone(),
            supervisor.clone(),
        ));
        let video = Arc::new(VideoSupervisor::new(
            host.spawner.clone(),
            host.volumes.clone(),
            pipeline.clone(),
            supervisor.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            host.volumes.clone(),
            resolved.limits.clone(),
        ));

        Self {
            ledger: Ledger::new(store.clone()),
            store,
            admission,
            audio,
            video,
            pipeline,
            host,
            config,
            min_output_bytes: supervisor.min_output_bytes,
        }
    }
}
