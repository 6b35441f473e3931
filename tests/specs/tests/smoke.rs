// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `field-controller` binary,
//! seed a course directly in its database, then drive complete sessions
//! through the real heartbeat and facade ports over real sockets.

use std::time::Duration;

use field_controller::store::{AlertType, CourseActionInput, CourseMode, SessionStatus, Store};
use field_controller_specs::{ControllerProcess, FakeCone};
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(10);

fn sequential_action(sequence: i64, device_id: &str, marks_run_complete: bool) -> CourseActionInput {
    CourseActionInput {
        sequence,
        device_id: device_id.to_owned(),
        device_name: Some(device_id.to_owned()),
        action: format!("action_{device_id}"),
        action_type: None,
        audio_file: None,
        instruction: None,
        min_time: 0.1,
        max_time: 60.0,
        triggers_next_athlete: false,
        marks_run_complete,
        group_identifier: None,
        behavior_config: None,
    }
}

fn colored_action(sequence: i64, device_id: &str, color: &str) -> CourseActionInput {
    CourseActionInput {
        sequence,
        device_id: device_id.to_owned(),
        device_name: Some(device_id.to_owned()),
        action: format!("action_{device_id}"),
        action_type: None,
        audio_file: None,
        instruction: None,
        min_time: 0.0,
        max_time: 999.9,
        triggers_next_athlete: false,
        marks_run_complete: false,
        group_identifier: None,
        behavior_config: Some(json!({"color": color})),
    }
}

/// Seed a course directly into the controller's database file, the way an
/// operator's course-builder tooling would ahead of a session — the facade
/// has no course-authoring route, only deploy/activate/deactivate.
async fn seed_sequential_course(db_path: &std::path::Path) -> anyhow::Result<i64> {
    let store = Store::open(db_path).await?;
    let course_id = store
        .create_course(
            "sprint".into(),
            None,
            "sequential".into(),
            CourseMode::Sequential,
            None,
            6,
            vec![
                sequential_action(0, "D0", false),
                sequential_action(1, "D1", false),
                sequential_action(2, "D2", false),
                sequential_action(3, "D3", false),
                sequential_action(4, "D4", false),
                sequential_action(5, "D5", true),
            ],
        )
        .await?;
    Ok(course_id)
}

async fn seed_pattern_course(db_path: &std::path::Path) -> anyhow::Result<i64> {
    let store = Store::open(db_path).await?;
    let course_id = store
        .create_course(
            "simon-says".into(),
            None,
            "pattern".into(),
            CourseMode::Pattern,
            None,
            4,
            vec![
                colored_action(0, "D1", "red"),
                colored_action(1, "D2", "yellow"),
                colored_action(2, "D3", "blue"),
                colored_action(3, "D4", "green"),
            ],
        )
        .await?;
    Ok(course_id)
}

async fn create_team_and_athlete(base_url: &str) -> anyhow::Result<(String, String)> {
    let client = reqwest::Client::new();
    let team: Value = client.post(format!("{base_url}/teams")).json(&json!({"name": "Track Club"})).send().await?.json().await?;
    let team_id = team["team_id"].as_str().expect("team_id present").to_owned();

    let athlete: Value = client
        .post(format!("{base_url}/teams/{team_id}/athletes"))
        .json(&json!({"name": "Jordan"}))
        .send()
        .await?
        .json()
        .await?;
    let athlete_id = athlete["athlete_id"].as_str().expect("athlete_id present").to_owned();

    Ok((team_id, athlete_id))
}

async fn create_and_start_session(
    base_url: &str,
    team_id: &str,
    course_id: i64,
    athlete_id: &str,
    pattern_config: Option<Value>,
) -> anyhow::Result<String> {
    let client = reqwest::Client::new();
    let mut body = json!({
        "team_id": team_id,
        "course_id": course_id,
        "athlete_ids": [athlete_id],
    });
    if let Some(cfg) = pattern_config {
        body["pattern_config"] = cfg;
    }
    let created: Value = client.post(format!("{base_url}/sessions")).json(&body).send().await?.json().await?;
    let session_id = created["session_id"].as_str().expect("session_id present").to_owned();

    let response = client.post(format!("{base_url}/sessions/{session_id}/start")).send().await?;
    anyhow::ensure!(response.status().is_success(), "session start failed: {}", response.status());

    Ok(session_id)
}

#[tokio::test]
async fn happy_path_sequential_run_completes_with_all_segments_touched() -> anyhow::Result<()> {
    let controller = ControllerProcess::start()?;
    controller.wait_healthy(TIMEOUT).await?;
    let course_id = seed_sequential_course(controller.db_path()).await?;

    let (team_id, athlete_id) = create_team_and_athlete(&controller.base_url()).await?;
    let session_id = create_and_start_session(&controller.base_url(), &team_id, course_id, &athlete_id, None).await?;

    let mut cone = FakeCone::connect(controller.heartbeat_port()).await?;
    for (idx, device) in ["D1", "D2", "D3", "D4", "D5"].iter().enumerate() {
        cone.touch(device, idx as f64 * 5.0).await?;
    }

    controller
        .wait_for_status(&session_id, TIMEOUT, |status| status["active_runs"].as_array().is_some_and(|runs| runs.is_empty()))
        .await?;

    let store = Store::open(controller.db_path()).await?;
    let session = store.get_session(session_id.clone()).await?.expect("session exists");
    assert_eq!(session.status, SessionStatus::Completed);

    let runs = store.runs_for_session(session_id).await?;
    assert_eq!(runs.len(), 1);
    let segments = store.segments_for_run(runs[0].run_id.clone()).await?;
    assert_eq!(segments.len(), 5);
    assert!(segments.iter().all(|s| s.touch_detected));
    assert!(segments.iter().all(|s| s.alert_type.is_none()));
    assert!(runs[0].total_time.is_some());

    Ok(())
}

#[tokio::test]
async fn skipped_device_sequential_run_marks_missed_touch_alert() -> anyhow::Result<()> {
    let controller = ControllerProcess::start()?;
    controller.wait_healthy(TIMEOUT).await?;
    let course_id = seed_sequential_course(controller.db_path()).await?;

    let (team_id, athlete_id) = create_team_and_athlete(&controller.base_url()).await?;
    let session_id = create_and_start_session(&controller.base_url(), &team_id, course_id, &athlete_id, None).await?;

    let mut cone = FakeCone::connect(controller.heartbeat_port()).await?;
    // D3 never fires; D4 arrives straight after D2, which should retroactively
    // mark the D2->D3 segment missed while still crediting D3->D4.
    for (idx, device) in ["D1", "D2", "D4", "D5"].iter().enumerate() {
        cone.touch(device, idx as f64 * 5.0).await?;
    }

    controller
        .wait_for_status(&session_id, TIMEOUT, |status| status["active_runs"].as_array().is_some_and(|runs| runs.is_empty()))
        .await?;

    let store = Store::open(controller.db_path()).await?;
    let runs = store.runs_for_session(session_id).await?;
    let segments = store.segments_for_run(runs[0].run_id.clone()).await?;

    let missed = segments.iter().find(|s| s.to_device == "D3").expect("segment to D3 exists");
    assert!(!missed.touch_detected);
    assert_eq!(missed.alert_type, Some(AlertType::MissedTouch));

    let recovered = segments.iter().find(|s| s.to_device == "D4").expect("segment to D4 exists");
    assert!(recovered.touch_detected);

    let untouched_count = segments.iter().filter(|s| !s.touch_detected).count();
    assert_eq!(untouched_count, 1);

    Ok(())
}

#[tokio::test]
async fn pattern_mode_correct_execution_completes_run() -> anyhow::Result<()> {
    let controller = ControllerProcess::start()?;
    controller.wait_healthy(TIMEOUT).await?;
    let course_id = seed_pattern_course(controller.db_path()).await?;

    let (team_id, athlete_id) = create_team_and_athlete(&controller.base_url()).await?;
    let pattern_config = json!({"sequence_length": 4, "allow_repeats": false});
    let session_id =
        create_and_start_session(&controller.base_url(), &team_id, course_id, &athlete_id, Some(pattern_config)).await?;

    let status = controller
        .wait_for_status(&session_id, TIMEOUT, |status| {
            status["active_runs"].as_array().is_some_and(|runs| runs.first().is_some_and(|r| r["pattern_devices"].is_array()))
        })
        .await?;
    let pattern_devices: Vec<String> = status["active_runs"][0]["pattern_devices"]
        .as_array()
        .expect("pattern_devices present")
        .iter()
        .map(|v| v.as_str().expect("device id string").to_owned())
        .collect();
    assert_eq!(pattern_devices.len(), 4);

    let mut cone = FakeCone::connect(controller.heartbeat_port()).await?;
    for device in &pattern_devices {
        cone.touch(device, 0.0).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    cone.touch("controller", 0.0).await?;

    controller
        .wait_for_status(&session_id, TIMEOUT, |status| status["active_runs"].as_array().is_some_and(|runs| runs.is_empty()))
        .await?;

    let store = Store::open(controller.db_path()).await?;
    let session = store.get_session(session_id.clone()).await?.expect("session exists");
    assert_eq!(session.status, SessionStatus::Completed);

    let runs = store.runs_for_session(session_id).await?;
    let segments = store.segments_for_run(runs[0].run_id.clone()).await?;
    assert_eq!(segments.len(), 4);
    assert!(segments.iter().all(|s| s.touch_detected));

    Ok(())
}

#[tokio::test]
async fn pattern_mode_debounce_rejects_bounced_touch() -> anyhow::Result<()> {
    let controller = ControllerProcess::start()?;
    controller.wait_healthy(TIMEOUT).await?;
    let course_id = seed_pattern_course(controller.db_path()).await?;

    let (team_id, athlete_id) = create_team_and_athlete(&controller.base_url()).await?;
    let pattern_config = json!({"sequence_length": 4, "allow_repeats": false});
    let session_id =
        create_and_start_session(&controller.base_url(), &team_id, course_id, &athlete_id, Some(pattern_config)).await?;

    let status = controller
        .wait_for_status(&session_id, TIMEOUT, |status| {
            status["active_runs"].as_array().is_some_and(|runs| runs.first().is_some_and(|r| r["pattern_devices"].is_array()))
        })
        .await?;
    let pattern_devices: Vec<String> = status["active_runs"][0]["pattern_devices"]
        .as_array()
        .expect("pattern_devices present")
        .iter()
        .map(|v| v.as_str().expect("device id string").to_owned())
        .collect();

    let mut cone = FakeCone::connect(controller.heartbeat_port()).await?;

    // Correct first step, then an immediate spurious re-fire of the same
    // cone: the global per-run debounce window should swallow it silently
    // rather than treat it as a wrong step.
    cone.touch(&pattern_devices[0], 0.0).await?;
    cone.touch(&pattern_devices[0], 0.2).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;

    for device in &pattern_devices[1..] {
        cone.touch(device, 0.0).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    cone.touch("controller", 0.0).await?;

    controller
        .wait_for_status(&session_id, TIMEOUT, |status| status["active_runs"].as_array().is_some_and(|runs| runs.is_empty()))
        .await?;

    let store = Store::open(controller.db_path()).await?;
    let session = store.get_session(session_id.clone()).await?.expect("session exists");
    assert_eq!(session.status, SessionStatus::Completed);

    let logs = reqwest::get(format!("{}/registry/logs?limit=50", controller.base_url())).await?.json::<Vec<Value>>().await?;
    assert!(logs.iter().all(|entry| !entry["message"].as_str().unwrap_or_default().contains("wrong step")));

    Ok(())
}
