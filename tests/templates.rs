//! Template Integration Tests
//!
//! Templates saved through the control surface, and jobs created from
//! them running through the driver.

mod common;

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use tokio_test::{assert_err, assert_ok};

use common::{Behavior, Rig};
use recdeck::core::{Control, Driver, DriverSettings};
use recdeck::domain::{InstanceStatus, RecurrencePattern, TemplateDefinition, MAX_DURATION_SECS};

fn rehearsal_template() -> TemplateDefinition {
    TemplateDefinition {
        name: "Rehearsal".to_string(),
        duration_secs: 900,
        recurrence: Some(RecurrencePattern::daily(
            NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
        )),
        capture_video: false,
        description: "band room".to_string(),
    }
}

#[tokio::test]
async fn test_template_lifecycle() {
    let rig = Rig::new(Behavior::until_stopped(1024));
    let control = Control::new(rig.recorder.clone());

    let created = assert_ok!(control.create_template(rehearsal_template()));
    assert_eq!(created.summary(), "Rehearsal: 15m, Daily at 19:00");
    assert_err!(control.create_template(rehearsal_template()));

    let mut too_long = rehearsal_template();
    too_long.name = "Marathon".to_string();
    too_long.duration_secs = MAX_DURATION_SECS + 1;
    assert_err!(control.create_template(too_long));

    let mut edited = rehearsal_template();
    edited.recurrence = None;
    edited.capture_video = true;
    let updated = assert_ok!(control.update_template("Rehearsal", edited));
    assert_eq!(updated.summary(), "Rehearsal: 15m, One-time recording, with video");
    assert_eq!(control.list_templates().unwrap().len(), 1);

    assert_ok!(control.delete_template("Rehearsal"));
    assert_err!(control.get_template("Rehearsal"));
    assert_err!(control.delete_template("Rehearsal"));
}

#[tokio::test]
async fn test_job_from_template_is_scheduled() {
    let rig = Rig::new(Behavior::finishes_after(Duration::from_millis(50), 64 * 1024));
    let control = Control::new(rig.recorder.clone());
    let driver = Driver::new(rig.recorder.clone(), DriverSettings::default());

    let template = assert_ok!(control.create_template(rehearsal_template()));
    let start = NaiveDate::from_ymd_opt(2026, 10, 5)
        .unwrap()
        .and_hms_opt(19, 0, 0)
        .unwrap();
    let id = assert_ok!(control.create_job(template.job_definition("Autumn rehearsals".to_string(), start)));

    // Later template edits leave the job alone
    let mut edited = rehearsal_template();
    edited.duration_secs = 3600;
    assert_ok!(control.update_template("Rehearsal", edited));
    let job = control.get_job(id).unwrap();
    assert_eq!(job.duration_secs, 900);
    assert_eq!(job.notes, "band room");

    let report = driver.tick_at(start).await.unwrap();
    assert_eq!(report.triggered, vec![(id, start.date())]);
    driver.wait_idle().await;
    let instance = rig
        .recorder
        .ledger
        .get_instance(id, start.date())
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}
