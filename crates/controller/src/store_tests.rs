// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{Duration as ChronoDuration, Utc};

use super::*;

fn action(sequence: i64, device_id: &str, min_time: f64, max_time: f64) -> CourseActionInput {
    CourseActionInput {
        sequence,
        device_id: device_id.to_owned(),
        device_name: Some(device_id.to_owned()),
        action: format!("action_{device_id}"),
        action_type: None,
        audio_file: None,
        instruction: None,
        min_time,
        max_time,
        triggers_next_athlete: false,
        marks_run_complete: false,
        group_identifier: None,
        behavior_config: None,
    }
}

async fn seeded_store() -> anyhow::Result<(Store, i64, String)> {
    let store = Store::open_in_memory().await?;
    store.set_setting("__team_seed".into(), "1".into()).await?;
    let conn_course_id = store
        .create_course(
            "Six Cone".into(),
            None,
            "conditioning".into(),
            CourseMode::Sequential,
            None,
            6,
            vec![
                action(0, "D0", 0.0, 999.9),
                action(1, "D1", 1.0, 30.0),
                action(2, "D2", 1.0, 30.0),
                action(3, "D3", 1.0, 30.0),
                action(4, "D4", 1.0, 30.0),
                action(5, "D5", 1.0, 30.0),
            ],
        )
        .await?;

    // teams/athletes aren't exposed through Store's public surface in this
    // test module's scope of interest; seed them directly via raw SQL isn't
    // available here, so sessions below use a fabricated team/athlete id —
    // acceptable since FK enforcement only matters for referential tests.
    Ok((store, conn_course_id, "team-1".to_owned()))
}

#[tokio::test]
async fn create_course_rejects_non_dense_sequence() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    let err = store
        .create_course("Bad".into(), None, "conditioning".into(), CourseMode::Sequential, None, 2, vec![action(0, "D0", 0.0, 1.0), action(2, "D1", 0.0, 1.0)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::ConstraintViolation);
    Ok(())
}

#[tokio::test]
async fn create_course_rejects_duplicate_name() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    store.create_course("Dup".into(), None, "conditioning".into(), CourseMode::Sequential, None, 1, vec![action(0, "D0", 0.0, 1.0)]).await?;
    let err = store
        .create_course("Dup".into(), None, "conditioning".into(), CourseMode::Sequential, None, 1, vec![action(0, "D0", 0.0, 1.0)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), crate::error::ErrorCode::ConstraintViolation);
    Ok(())
}

#[tokio::test]
async fn get_course_orders_actions_by_sequence() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;
    let course = store.get_course(course_id).await?.expect("course exists");
    let ids: Vec<String> = course.actions.iter().map(|a| a.device_id.clone()).collect();
    assert_eq!(ids, vec!["D0", "D1", "D2", "D3", "D4", "D5"]);
    Ok(())
}

#[tokio::test]
async fn settings_round_trip_and_seed_defaults_present() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    assert_eq!(store.get_setting("distance_unit".into()).await?, Some("meters".to_owned()));

    store.set_setting("system_volume".into(), "60".into()).await?;
    assert_eq!(store.get_setting("system_volume".into()).await?, Some("60".to_owned()));

    let all = store.all_settings().await?;
    assert!(all.iter().any(|(k, _)| k == "wifi_ssid"));
    Ok(())
}

#[tokio::test]
async fn sequential_segment_creation_is_idempotent() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;
    store.create_segments_for_run("run-1".into(), course_id).await?;
    store.create_segments_for_run("run-1".into(), course_id).await?;
    // Idempotence: second call is a no-op rather than erroring or duplicating.
    Ok(())
}

#[tokio::test]
async fn record_touch_is_idempotent_per_open_segment() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    // Manually create a segment without a real run FK (runs table isn't
    // exercised end-to-end here; segment-level behavior is tested directly).
    let conn = store.conn.clone();
    {
        let guard = conn.lock().await;
        guard.execute(
            "INSERT INTO segments (run_id, sequence, from_device, to_device, expected_min_time, expected_max_time)
             VALUES ('run-x', 0, 'D0', 'D1', 1.0, 30.0)",
            [],
        )?;
    }

    let t0 = Utc::now();
    let first = store.record_touch("run-x".into(), "D1".into(), t0).await?;
    assert!(first.is_some());

    let second = store.record_touch("run-x".into(), "D1".into(), t0 + ChronoDuration::seconds(1)).await?;
    assert!(second.is_none());
    Ok(())
}

#[tokio::test]
async fn check_segment_alerts_flags_too_fast_and_too_slow() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    let conn = store.conn.clone();
    let (fast_id, slow_id): (i64, i64);
    {
        let guard = conn.lock().await;
        guard.execute(
            "INSERT INTO segments (run_id, sequence, from_device, to_device, expected_min_time, expected_max_time, actual_time)
             VALUES ('run-y', 0, 'D0', 'D1', 2.0, 10.0, 0.5)",
            [],
        )?;
        fast_id = guard.last_insert_rowid();
        guard.execute(
            "INSERT INTO segments (run_id, sequence, from_device, to_device, expected_min_time, expected_max_time, actual_time)
             VALUES ('run-y', 1, 'D1', 'D2', 2.0, 10.0, 20.0)",
            [],
        )?;
        slow_id = guard.last_insert_rowid();
    }

    store.check_segment_alerts(fast_id).await?;
    store.check_segment_alerts(slow_id).await?;

    let segs = store.segments_for_run("run-y".into()).await?;
    let fast = segs.iter().find(|s| s.segment_id == fast_id).expect("fast segment");
    let slow = segs.iter().find(|s| s.segment_id == slow_id).expect("slow segment");
    assert!(matches!(fast.alert_type, Some(AlertType::TooFast)));
    assert!(matches!(slow.alert_type, Some(AlertType::TooSlow)));
    Ok(())
}

#[tokio::test]
async fn find_open_segment_id_ignores_touched_segments() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;
    store.create_segments_for_run("run-z".into(), course_id).await?;
    let t0 = Utc::now();
    store.record_touch("run-z".into(), "D1".into(), t0).await?;

    assert!(store.find_open_segment_id("run-z".into(), "D1".into()).await?.is_none());
    assert!(store.find_open_segment_id("run-z".into(), "D2".into()).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn duplicate_course_uniquifies_name_and_copies_actions() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;

    let first_copy_id = store.duplicate_course(course_id).await?;
    let first_copy = store.get_course(first_copy_id).await?.expect("copy exists");
    assert_eq!(first_copy.course_name, "Six Cone (copy)");
    assert_eq!(first_copy.actions.len(), 6);

    let second_copy_id = store.duplicate_course(course_id).await?;
    let second_copy = store.get_course(second_copy_id).await?.expect("second copy exists");
    assert_eq!(second_copy.course_name, "Six Cone (copy 2)");
    Ok(())
}

#[tokio::test]
async fn dashboard_stats_counts_rows_across_tables() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;
    let conn = store.conn.clone();
    {
        let guard = conn.lock().await;
        guard.execute("INSERT INTO teams (team_id, name) VALUES ('t1', 'Team One')", [])?;
        guard.execute("INSERT INTO athletes (athlete_id, team_id, name) VALUES ('a1', 't1', 'Athlete One')", [])?;
        guard.execute(
            &format!("INSERT INTO sessions (session_id, team_id, course_id, status) VALUES ('s1', 't1', {course_id}, 'active')"),
            [],
        )?;
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status) VALUES ('r1', 's1', 'a1', {course_id}, 0, 'completed')"),
            [],
        )?;
    }

    let stats = store.dashboard_stats().await?;
    assert_eq!(stats.total_teams, 1);
    assert_eq!(stats.total_athletes, 1);
    assert_eq!(stats.total_courses, 1);
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.completed_runs, 1);
    assert_eq!(stats.active_sessions, 1);
    Ok(())
}

#[tokio::test]
async fn recent_activity_orders_newest_completion_first() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;
    let conn = store.conn.clone();
    {
        let guard = conn.lock().await;
        guard.execute("INSERT INTO teams (team_id, name) VALUES ('t1', 'Team One')", [])?;
        guard.execute("INSERT INTO athletes (athlete_id, team_id, name) VALUES ('a1', 't1', 'Athlete One')", [])?;
        guard.execute("INSERT INTO athletes (athlete_id, team_id, name) VALUES ('a2', 't1', 'Athlete Two')", [])?;
        guard.execute(
            &format!("INSERT INTO sessions (session_id, team_id, course_id, status) VALUES ('s1', 't1', {course_id}, 'active')"),
            [],
        )?;
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status, total_time, completed_at) VALUES ('r1', 's1', 'a1', {course_id}, 0, 'completed', 20.0, '2026-01-01T00:00:00Z')"),
            [],
        )?;
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status, total_time, completed_at) VALUES ('r2', 's1', 'a2', {course_id}, 1, 'completed', 18.0, '2026-01-02T00:00:00Z')"),
            [],
        )?;
    }

    let activity = store.recent_activity(10).await?;
    assert_eq!(activity.len(), 2);
    assert_eq!(activity[0].run_id, "r2");
    assert_eq!(activity[1].run_id, "r1");
    Ok(())
}

#[tokio::test]
async fn course_rankings_orders_by_best_time_per_athlete() -> anyhow::Result<()> {
    let (store, course_id, _) = seeded_store().await?;
    let conn = store.conn.clone();
    {
        let guard = conn.lock().await;
        guard.execute("INSERT INTO teams (team_id, name) VALUES ('t1', 'Team One')", [])?;
        guard.execute("INSERT INTO athletes (athlete_id, team_id, name) VALUES ('a1', 't1', 'Athlete One')", [])?;
        guard.execute("INSERT INTO athletes (athlete_id, team_id, name) VALUES ('a2', 't1', 'Athlete Two')", [])?;
        guard.execute(
            &format!("INSERT INTO sessions (session_id, team_id, course_id, status) VALUES ('s1', 't1', {course_id}, 'active')"),
            [],
        )?;
        // a1 ran twice (different queue slots); best time is 19.0, not the
        // 22.0 first attempt.
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status, total_time) VALUES ('r1', 's1', 'a1', {course_id}, 0, 'completed', 22.0)"),
            [],
        )?;
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status, total_time) VALUES ('r2', 's1', 'a1', {course_id}, 1, 'completed', 19.0)"),
            [],
        )?;
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status, total_time) VALUES ('r3', 's1', 'a2', {course_id}, 2, 'completed', 20.5)"),
            [],
        )?;
    }

    let rankings = store.course_rankings(course_id, 10).await?;
    assert_eq!(rankings.len(), 2);
    assert_eq!(rankings[0].athlete_id, "a1");
    assert_eq!(rankings[0].best_time, 19.0);
    assert_eq!(rankings[0].run_count, 2);
    assert_eq!(rankings[1].athlete_id, "a2");
    Ok(())
}

#[tokio::test]
async fn recover_incomplete_sessions_transitions_active_to_incomplete() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    let conn = store.conn.clone();
    {
        let guard = conn.lock().await;
        guard.execute("INSERT INTO teams (team_id, name) VALUES ('t1', 'Team One')", [])?;
        guard.execute(
            "INSERT INTO courses (course_name, course_type, mode, total_devices) VALUES ('C', 'conditioning', 'sequential', 1)",
            [],
        )?;
        let course_id = guard.last_insert_rowid();
        guard.execute(
            &format!("INSERT INTO sessions (session_id, team_id, course_id, status) VALUES ('s1', 't1', {course_id}, 'active')"),
            [],
        )?;
        guard.execute("INSERT INTO athletes (athlete_id, team_id, name) VALUES ('a1', 't1', 'Athlete One')", [])?;
        guard.execute(
            &format!("INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status) VALUES ('r1', 's1', 'a1', {course_id}, 0, 'running')"),
            [],
        )?;
    }

    let recovered = store.recover_incomplete_sessions().await?;
    assert_eq!(recovered, vec!["s1".to_owned()]);

    let session = store.get_session("s1".into()).await?.expect("session exists");
    assert_eq!(session.status, SessionStatus::Incomplete);
    let run = store.get_run("r1".into()).await?.expect("run exists");
    assert_eq!(run.status, RunStatus::Incomplete);
    Ok(())
}
