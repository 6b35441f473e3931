// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

fn report(node_id: &str) -> HeartbeatReport {
    HeartbeatReport {
        node_id: node_id.to_owned(),
        address: "10.0.0.5:9000".to_owned(),
        status: None,
        sensors: None,
        battery_level: Some(88.0),
        accelerometer_working: Some(true),
        audio_working: Some(true),
        assigned_action_reported: None,
        clock_skew_ms: Some(10),
    }
}

#[tokio::test]
async fn upsert_creates_then_updates_node() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;
    let snap = registry.snapshot().await;
    assert_eq!(snap.nodes.len(), 1);
    assert_eq!(snap.nodes[0].battery_level, Some(88.0));

    let mut second = report("D1");
    second.battery_level = Some(50.0);
    registry.upsert_node(second, NodeStatus::Standby).await;
    let snap = registry.snapshot().await;
    assert_eq!(snap.nodes.len(), 1);
    assert_eq!(snap.nodes[0].battery_level, Some(50.0));
}

#[tokio::test]
async fn heartbeat_never_overwrites_led_or_audio_state() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;
    registry
        .set_commanded_state("D1", Some("solid_red".to_owned()), Some("beep".to_owned()))
        .await;

    // A fresh heartbeat carries no led/audio fields to accept by construction.
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;

    assert_eq!(registry.commanded_led_pattern("D1").await, Some("solid_red".to_owned()));
    assert_eq!(registry.commanded_audio_clip("D1").await, Some("beep".to_owned()));
}

#[tokio::test]
async fn derive_status_follows_course_status_and_assignment() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;

    assert_eq!(registry.derive_status("D1").await, NodeStatus::Standby);

    let mut assignments = std::collections::HashMap::new();
    assignments.insert("D1".to_owned(), "start_beep".to_owned());
    registry.set_assignments(assignments).await;
    registry.set_course(CourseStatus::Deployed, Some("Course A".to_owned())).await;
    assert_eq!(registry.derive_status("D1").await, NodeStatus::Deployed);

    registry.set_course(CourseStatus::Active, Some("Course A".to_owned())).await;
    assert_eq!(registry.derive_status("D1").await, NodeStatus::Active);

    assert_eq!(registry.derive_status("D2").await, NodeStatus::Standby);
}

#[tokio::test]
async fn send_command_fails_without_sender() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;
    let sent = registry.send_command("D1", crate::command::Command::stop(None)).await;
    assert!(!sent);
}

#[tokio::test]
async fn send_command_succeeds_with_live_sender() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    registry.set_sender("D1", Some(tx)).await;

    let sent = registry.send_command("D1", crate::command::Command::stop(None)).await;
    assert!(sent);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn send_command_nulls_sender_on_closed_channel() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    drop(rx);
    registry.set_sender("D1", Some(tx)).await;

    let sent = registry.send_command("D1", crate::command::Command::stop(None)).await;
    assert!(!sent);
    let sent_again = registry.send_command("D1", crate::command::Command::stop(None)).await;
    assert!(!sent_again);
}

#[tokio::test]
async fn clear_assignments_removes_all() {
    let registry = Registry::new(Duration::from_secs(15));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;
    let mut assignments = std::collections::HashMap::new();
    assignments.insert("D1".to_owned(), "start_beep".to_owned());
    registry.set_assignments(assignments).await;
    assert_eq!(registry.assignment("D1").await, Some("start_beep".to_owned()));

    registry.clear_assignments().await;
    assert_eq!(registry.assignment("D1").await, None);
}

#[tokio::test]
async fn offline_sweep_marks_silent_nodes_offline() {
    let registry = Registry::new(Duration::from_millis(10));
    registry.upsert_node(report("D1"), NodeStatus::Standby).await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::time::pause();
    let handle = tokio::spawn(async move { registry.run_offline_sweep(shutdown_clone).await });

    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    shutdown.cancel();
    let _ = handle.await;
}
