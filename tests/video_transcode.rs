//! Video Capture and Transcode Integration Tests
//!
//! Tests for storage preflight, the raw → processed hand-off, and the
//! transcode queue's cancellation and verification rules.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{capture_settings, fast_settings, Behavior, FakeMedia, FakeSpawner, FakeVolumes, TB};
use recdeck::capture::video::{processed_path, raw_path};
use recdeck::capture::{
    CancelResult, CaptureKind, TaskState, TranscodePipeline, VideoRequest, VideoState,
    VideoSupervisor,
};
use recdeck::config::{CaptureSettings, TranscodeConfig};
use recdeck::core::{Admission, AdmissionController, AdmissionLimits};
use recdeck::error::CaptureError;

const GOOD_BYTES: usize = 256 * 1024;

struct Setup {
    _temp: TempDir,
    settings: CaptureSettings,
    spawner: Arc<FakeSpawner>,
    volumes: Arc<FakeVolumes>,
    media: Arc<FakeMedia>,
    pipeline: Arc<TranscodePipeline>,
    supervisor: VideoSupervisor,
}

fn setup_with_media(default: Behavior, media: FakeMedia) -> Setup {
    let temp = TempDir::new().unwrap();
    let settings = capture_settings(temp.path());
    let spawner = Arc::new(FakeSpawner::new(default));
    let volumes = Arc::new(FakeVolumes::new(TB));
    let media = Arc::new(media);
    let pipeline = Arc::new(TranscodePipeline::new(
        spawner.clone(),
        media.clone(),
        "ffmpeg",
        TranscodeConfig::default(),
    ));
    let supervisor = VideoSupervisor::new(
        spawner.clone(),
        volumes.clone(),
        pipeline.clone(),
        fast_settings(),
    );
    Setup {
        _temp: temp,
        settings,
        spawner,
        volumes,
        media,
        pipeline,
        supervisor,
    }
}

fn setup(default: Behavior) -> Setup {
    setup_with_media(default, FakeMedia::new(Some(60.0), &["h264_v4l2m2m"]))
}

fn admit(settings: &CaptureSettings) -> Admission {
    AdmissionController::new(Arc::new(FakeVolumes::new(TB)), AdmissionLimits::default())
        .admit(60, false, CaptureKind::Video, settings)
        .unwrap()
}

fn request(settings: &CaptureSettings, stem: &str) -> VideoRequest {
    VideoRequest::from_settings(settings, stem, Duration::from_secs(60)).unwrap()
}

/// Write a fake raw capture for direct pipeline tests
fn raw_file(settings: &CaptureSettings, stem: &str) -> (PathBuf, PathBuf) {
    let raw = raw_path(&settings.video_dir, stem);
    std::fs::create_dir_all(raw.parent().unwrap()).unwrap();
    std::fs::write(&raw, vec![1u8; GOOD_BYTES]).unwrap();
    (raw, processed_path(&settings.video_dir, stem))
}

fn part_of(destination: &Path) -> PathBuf {
    PathBuf::from(format!("{}.part", destination.display()))
}

async fn wait_until_running(pipeline: &TranscodePipeline, id: recdeck::capture::TaskId) {
    for _ in 0..200 {
        if pipeline.progress(id).map(|t| t.state) == Some(TaskState::Running) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never started", id);
}

#[tokio::test]
async fn test_capture_hands_raw_to_transcode() {
    let s = setup(Behavior::finishes_after(Duration::from_millis(30), GOOD_BYTES));
    let admission = admit(&s.settings);

    let handle = s
        .supervisor
        .start(&admission, request(&s.settings, "Service_20261004_1000"))
        .await
        .unwrap();
    let raw = raw_path(&s.settings.video_dir, "Service_20261004_1000");
    let processed = processed_path(&s.settings.video_dir, "Service_20261004_1000");
    assert_eq!(handle.info.outputs, vec![raw.clone()]);

    let outcome = handle.wait().await;
    assert_eq!(outcome.result.unwrap(), vec![raw.clone()]);

    let task = s.supervisor.status().transcode.expect("transcode task queued");
    assert_eq!(task.source, raw);
    assert_eq!(task.destination, processed);

    let done = s.pipeline.wait_for(task.id).await.unwrap();
    assert_eq!(done.state, TaskState::Completed, "error: {:?}", done.error);
    assert_eq!(done.percent, 100);
    assert_eq!(done.encoder.as_deref(), Some("h264_v4l2m2m"));
    assert!(processed.exists());
    assert!(!part_of(&processed).exists());
    assert!(!raw.exists(), "raw is removed after a verified transcode");
    assert_eq!(s.supervisor.status().state, VideoState::Idle);

    let specs = s.spawner.specs();
    assert_eq!(specs.len(), 2);
    assert!(specs[0].display().contains("-rtsp_transport tcp -i rtsp://10.0.0.5/1 -c copy"));
    assert!(specs[1].display().contains("-c:v h264_v4l2m2m -b:v 4M"));
}

#[tokio::test]
async fn test_stop_finalizes_and_enqueues() {
    let s = setup(Behavior::until_stopped(GOOD_BYTES));
    let admission = admit(&s.settings);

    s.supervisor
        .start(&admission, request(&s.settings, "stopped"))
        .await
        .unwrap();
    assert_eq!(s.supervisor.status().state, VideoState::CapturingRaw);

    // The transcode that follows
    s.spawner.push(Behavior::finishes_after(Duration::from_millis(200), GOOD_BYTES));
    let stopped = s.supervisor.stop().await;
    assert!(stopped.outcome().unwrap().is_success());

    let task = s.supervisor.status().transcode.unwrap();
    assert!(!task.state.is_finished());
    assert_eq!(s.supervisor.status().state, VideoState::Transcoding);

    let done = s.pipeline.wait_for(task.id).await.unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(s.supervisor.status().state, VideoState::Idle);
}

#[tokio::test]
async fn test_unmounted_storage_rejected_before_spawn() {
    let s = setup(Behavior::until_stopped(GOOD_BYTES));
    s.volumes.set_mounted(false);
    let admission = admit(&s.settings);

    match s.supervisor.start(&admission, request(&s.settings, "nomount")).await {
        Err(CaptureError::Storage(reason)) => {
            assert!(reason.contains("not a mounted volume"), "got: {}", reason)
        }
        other => panic!("expected Storage error, got {:?}", other.map(|h| h.info)),
    }
    assert!(s.spawner.specs().is_empty());
    assert!(!s.supervisor.is_busy());
}

#[tokio::test]
async fn test_missing_storage_rejected() {
    let s = setup(Behavior::until_stopped(GOOD_BYTES));
    let mut settings = s.settings.clone();
    settings.video_dir = s.settings.video_dir.join("not-plugged-in");
    let admission = admit(&settings);

    let result = s.supervisor.start(&admission, request(&settings, "gone")).await;
    assert!(matches!(result, Err(CaptureError::Storage(reason)) if reason.contains("does not exist")));
    assert!(s.spawner.specs().is_empty());
}

#[tokio::test]
async fn test_unmounted_allowed_when_not_required() {
    let s = setup(Behavior::finishes_after(Duration::from_millis(10), GOOD_BYTES));
    s.volumes.set_mounted(false);
    let mut settings = s.settings.clone();
    settings.require_mount = false;
    let admission = admit(&settings);

    let outcome = s
        .supervisor
        .start(&admission, request(&settings, "local"))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_success());
}

#[test]
fn test_stream_url_required() {
    let temp = TempDir::new().unwrap();
    let mut settings = capture_settings(temp.path());
    settings.stream_url = None;

    let result = VideoRequest::from_settings(&settings, "x", Duration::from_secs(60));
    assert!(matches!(result, Err(CaptureError::Device(reason)) if reason.contains("not configured")));
}

#[tokio::test]
async fn test_empty_raw_fails_without_transcode() {
    let s = setup(Behavior::finishes_after(Duration::from_millis(10), 0));
    let admission = admit(&s.settings);

    let outcome = s
        .supervisor
        .start(&admission, request(&s.settings, "empty"))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.error().unwrap().contains("is empty"));
    assert!(s.supervisor.status().transcode.is_none());
    assert!(s.pipeline.snapshot().is_empty());
}

#[tokio::test]
async fn test_progress_then_cancel_leaves_no_partial_output() {
    let s = setup(Behavior::Record {
        bytes: GOOD_BYTES,
        exit_after: None,
        exit_code: 0,
        stdout: vec!["frame=900".to_string(), "out_time_us=30000000".to_string()],
    });
    let (raw, processed) = raw_file(&s.settings, "cancelled");

    let id = s.pipeline.enqueue(raw.clone(), processed.clone());
    wait_until_running(&s.pipeline, id).await;
    for _ in 0..200 {
        if s.pipeline.progress(id).unwrap().percent == 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(s.pipeline.progress(id).unwrap().percent, 50);

    assert_eq!(s.pipeline.cancel(id), CancelResult::Cancelling);
    let done = s.pipeline.wait_for(id).await.unwrap();
    assert_eq!(done.state, TaskState::Cancelled);
    assert!(!processed.exists());
    assert!(!part_of(&processed).exists());
    assert!(raw.exists(), "raw capture is kept for a manual retry");

    assert_eq!(s.pipeline.cancel(id), CancelResult::AlreadyFinished(TaskState::Cancelled));
}

#[tokio::test]
async fn test_one_task_at_a_time_and_queued_cancel() {
    let s = setup(Behavior::finishes_after(Duration::from_millis(10), GOOD_BYTES));
    s.spawner.push(Behavior::until_stopped(GOOD_BYTES));
    let (raw_a, out_a) = raw_file(&s.settings, "first");
    let (raw_b, out_b) = raw_file(&s.settings, "second");

    let a = s.pipeline.enqueue(raw_a, out_a);
    let b = s.pipeline.enqueue(raw_b, out_b);
    wait_until_running(&s.pipeline, a).await;
    assert_eq!(s.pipeline.progress(b).unwrap().state, TaskState::Queued);
    assert_eq!(s.spawner.specs().len(), 1);

    assert_eq!(s.pipeline.cancel(b), CancelResult::Dequeued);
    assert_eq!(s.pipeline.cancel(a), CancelResult::Cancelling);
    assert_eq!(s.pipeline.wait_for(a).await.unwrap().state, TaskState::Cancelled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.spawner.specs().len(), 1, "dequeued task never ran");
    assert_eq!(
        s.pipeline.cancel(recdeck::capture::TaskId::nil()),
        CancelResult::NotFound
    );
}

#[tokio::test]
async fn test_duration_mismatch_fails_and_keeps_raw() {
    let s = setup(Behavior::finishes_after(Duration::from_millis(10), GOOD_BYTES));
    let (raw, processed) = raw_file(&s.settings, "truncated");
    s.media.set_duration(&part_of(&processed), 30.0);

    let id = s.pipeline.enqueue(raw.clone(), processed.clone());
    let done = s.pipeline.wait_for(id).await.unwrap();
    assert_eq!(done.state, TaskState::Failed);
    assert!(done.error.unwrap().contains("duration mismatch"));
    assert!(!processed.exists());
    assert!(!part_of(&processed).exists());
    assert!(raw.exists());
}

#[tokio::test]
async fn test_software_encoder_fallback() {
    let s = setup_with_media(
        Behavior::finishes_after(Duration::from_millis(10), GOOD_BYTES),
        FakeMedia::new(Some(60.0), &["libx264"]),
    );
    let (raw, processed) = raw_file(&s.settings, "software");

    let id = s.pipeline.enqueue(raw, processed);
    let done = s.pipeline.wait_for(id).await.unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.encoder.as_deref(), Some("libx264"));
    assert!(s.spawner.specs()[0].display().contains("-c:v libx264"));
}

#[tokio::test]
async fn test_failed_encode_reports_exit() {
    let s = setup(Behavior::crashes_after(Duration::from_millis(10), 1));
    let (raw, processed) = raw_file(&s.settings, "broken");

    let id = s.pipeline.enqueue(raw.clone(), processed);
    let done = s.pipeline.wait_for(id).await.unwrap();
    assert_eq!(done.state, TaskState::Failed);
    let error = done.error.unwrap();
    assert!(error.contains("code 1"), "got: {}", error);
    assert!(raw.exists());
}
