//! Manual Capture Integration Tests
//!
//! Admission, busy lanes and partial starts for operator-initiated
//! captures.

mod common;

use std::time::Duration;

use common::{Behavior, Rig};
use recdeck::capture::{AudioState, EndReason, Lane, StopResult};
use recdeck::core::{AdmissionLimits, Control, Decision};
use recdeck::CaptureKind;

const GOOD_BYTES: usize = 64 * 1024;

fn control(default: Behavior) -> (Rig, Control) {
    let rig = Rig::new(default);
    let control = Control::new(rig.recorder.clone());
    (rig, control)
}

fn rejection(decision: Decision) -> String {
    match decision {
        Decision::Rejected(reason) => reason,
        Decision::Started(capture) => panic!("expected rejection, started {}", capture.stem),
    }
}

#[tokio::test]
async fn test_long_capture_requires_override() {
    let (rig, control) = control(Behavior::until_stopped(GOOD_BYTES));

    let reason = rejection(
        control
            .start_manual_capture(CaptureKind::Audio, 18_000, false)
            .await
            .unwrap(),
    );
    assert!(reason.contains("14400"), "got: {}", reason);
    assert!(rig.spawner.specs().is_empty());

    let decision = control
        .start_manual_capture(CaptureKind::Audio, 18_000, true)
        .await
        .unwrap();
    assert!(decision.is_started());
    let report = control.stop_capture(CaptureKind::Audio).await;
    let outcome = report.audio.unwrap();
    assert_eq!(outcome.outcome().unwrap().ended_by, EndReason::StopRequested);
    assert!(report.video.is_none());
}

#[tokio::test]
async fn test_ceiling_applies_even_with_override() {
    let (rig, control) = control(Behavior::until_stopped(GOOD_BYTES));
    let reason = rejection(
        control
            .start_manual_capture(CaptureKind::Audio, 90_000, true)
            .await
            .unwrap(),
    );
    assert!(reason.contains("absolute ceiling"), "got: {}", reason);
    assert!(rig.spawner.specs().is_empty());
}

#[tokio::test]
async fn test_free_space_must_cover_twice_the_estimate() {
    let (rig, control) = control(Behavior::until_stopped(GOOD_BYTES));
    let estimate = AdmissionLimits::default().audio_estimate(3600);

    rig.volumes.set_free(estimate);
    let reason = rejection(
        control
            .start_manual_capture(CaptureKind::Audio, 3600, false)
            .await
            .unwrap(),
    );
    assert!(reason.contains("Insufficient disk space"), "got: {}", reason);
    assert!(rig.spawner.specs().is_empty());

    rig.volumes.set_free(estimate * 5 / 2);
    let decision = control
        .start_manual_capture(CaptureKind::Audio, 3600, false)
        .await
        .unwrap();
    match decision {
        Decision::Started(capture) => {
            assert!(capture.stem.starts_with("manual_"));
            assert_eq!(capture.sessions.len(), 1);
            assert!(capture.failures.is_empty());
        }
        Decision::Rejected(reason) => panic!("unexpected rejection: {}", reason),
    }
    control.stop_capture(CaptureKind::Audio).await;
}

#[tokio::test]
async fn test_busy_lane_rejected() {
    let (rig, control) = control(Behavior::until_stopped(GOOD_BYTES));

    assert!(control
        .start_manual_capture(CaptureKind::Audio, 600, false)
        .await
        .unwrap()
        .is_started());
    let reason = rejection(
        control
            .start_manual_capture(CaptureKind::Both, 600, false)
            .await
            .unwrap(),
    );
    assert!(reason.contains("audio capture already in progress"), "got: {}", reason);
    assert_eq!(rig.spawner.specs().len(), 1);
    assert_eq!(control.get_status().audio.state, AudioState::Recording);

    control.stop_capture(CaptureKind::Audio).await;
}

#[tokio::test]
async fn test_both_lanes_start_independently() {
    let (rig, control) = control(Behavior::until_stopped(GOOD_BYTES));
    rig.volumes.set_mounted(false);

    let decision = control
        .start_manual_capture(CaptureKind::Both, 600, false)
        .await
        .unwrap();
    let capture = match decision {
        Decision::Started(capture) => capture,
        Decision::Rejected(reason) => panic!("audio should still start: {}", reason),
    };
    assert_eq!(capture.sessions.len(), 1);
    assert_eq!(capture.failures.len(), 1);
    assert_eq!(capture.failures[0].0, Lane::Video);
    assert!(capture.failures[0].1.contains("not a mounted volume"));

    let report = control.stop_capture(CaptureKind::Both).await;
    assert!(report.audio.unwrap().outcome().is_some());
    assert!(matches!(report.video, Some(StopResult::NothingInProgress)));
}

#[tokio::test]
async fn test_all_lanes_failing_is_a_rejection() {
    let (rig, control) = control(Behavior::FailSpawn("ffmpeg: not found".to_string()));
    rig.volumes.set_mounted(false);

    let reason = rejection(
        control
            .start_manual_capture(CaptureKind::Both, 600, false)
            .await
            .unwrap(),
    );
    assert!(reason.contains("audio:"), "got: {}", reason);
    assert!(reason.contains("video:"), "got: {}", reason);
    assert!(!rig.recorder.audio.is_busy());
}

#[tokio::test]
async fn test_stop_when_idle() {
    let (_rig, control) = control(Behavior::until_stopped(GOOD_BYTES));
    let report = control.stop_capture(CaptureKind::Both).await;
    assert!(matches!(report.audio, Some(StopResult::NothingInProgress)));
    assert!(matches!(report.video, Some(StopResult::NothingInProgress)));
}

#[tokio::test]
async fn test_manual_capture_runs_to_its_duration() {
    let (rig, control) = control(Behavior::until_stopped(GOOD_BYTES));

    let capture = match control
        .start_manual_capture(CaptureKind::Audio, 1, false)
        .await
        .unwrap()
    {
        Decision::Started(capture) => capture,
        Decision::Rejected(reason) => panic!("unexpected rejection: {}", reason),
    };
    let handle = capture.sessions.into_iter().next().unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert_eq!(outcome.ended_by, EndReason::DurationReached);
    let files = outcome.result.unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.starts_with(&rig.settings.audio_dir)));
}
