// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device registry (component C).
//!
//! The registry is the single source of truth for "who is currently
//! reachable." Cones register themselves implicitly on their first
//! heartbeat; a background sweep marks nodes offline after a period of
//! silence. All access is guarded by one mutex, matching the discipline in
//! the concurrency model: briefly acquired for reads/writes, released before
//! any network I/O longer than a single frame write.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::Command;

/// Logical identifier for the controller's own virtual cone ("Device 0"),
/// surfaced in snapshots so the UI can render a gateway card.
pub const CONTROLLER_NODE_ID: &str = "controller";

/// Course-wide lifecycle status, mirrored onto every node's derived status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CourseStatus {
    Inactive,
    Deployed,
    Active,
}

/// Per-node display status, derived from course status plus whether the
/// node currently has an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Deployed,
    Standby,
    Offline,
}

/// Handle used by the Command Emitter to push a frame to a connected cone.
/// The receiving half is drained by that connection's writer task.
pub type NodeSender = mpsc::UnboundedSender<Command>;

/// One registry entry: a cone's last-known state plus its transient sender.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: String,
    pub address: String,
    pub status: NodeStatus,
    pub sensors: Option<serde_json::Value>,
    pub battery_level: Option<f64>,
    pub accelerometer_working: Option<bool>,
    pub audio_working: Option<bool>,
    pub led_pattern: Option<String>,
    pub audio_clip: Option<String>,
    pub assigned_action: Option<String>,
    pub clock_skew_ms: Option<i64>,
    pub last_seen: Instant,
    #[allow(dead_code)]
    sender: Option<NodeSender>,
}

impl Node {
    fn new(node_id: String, address: String) -> Self {
        Self {
            node_id,
            address,
            status: NodeStatus::Standby,
            sensors: None,
            battery_level: None,
            accelerometer_working: None,
            audio_working: None,
            led_pattern: None,
            audio_clip: None,
            assigned_action: None,
            clock_skew_ms: None,
            last_seen: Instant::now(),
            sender: None,
        }
    }
}

/// Fields reported by a cone on a heartbeat frame. Deliberately has no
/// `led_pattern`/`audio_clip` fields: LED and audio state flow
/// controller-to-device only, and the decoder must not be able to read them
/// from an inbound frame even if a buggy device sends them.
#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub node_id: String,
    pub address: String,
    pub status: Option<String>,
    pub sensors: Option<serde_json::Value>,
    pub battery_level: Option<f64>,
    pub accelerometer_working: Option<bool>,
    pub audio_working: Option<bool>,
    pub assigned_action_reported: Option<String>,
    pub clock_skew_ms: Option<i64>,
}

/// A read-only, deep-copied view of the registry suitable for marshaling to
/// the UI without holding any lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub course_status: CourseStatus,
    pub selected_course: Option<String>,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub address: String,
    pub status: String,
    pub battery_level: Option<f64>,
    pub led_pattern: Option<String>,
    pub audio_clip: Option<String>,
    pub assigned_action: Option<String>,
    pub clock_skew_ms: Option<i64>,
    pub last_seen_secs_ago: u64,
}

struct Inner {
    nodes: HashMap<String, Node>,
    course_status: CourseStatus,
    selected_course: Option<String>,
    assignments: HashMap<String, String>,
}

/// The device registry, component C.
pub struct Registry {
    inner: Mutex<Inner>,
    offline_after: Duration,
}

impl Registry {
    pub fn new(offline_after: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                course_status: CourseStatus::Inactive,
                selected_course: None,
                assignments: HashMap::new(),
            }),
            offline_after,
        }
    }

    /// Derive a node's display status from course status and assignment
    /// presence, per the heartbeat server's contract.
    pub async fn derive_status(&self, node_id: &str) -> NodeStatus {
        let inner = self.inner.lock().await;
        let has_assignment = inner.assignments.contains_key(node_id);
        match (inner.course_status, has_assignment) {
            (CourseStatus::Active, true) => NodeStatus::Active,
            (CourseStatus::Deployed, true) => NodeStatus::Deployed,
            _ => NodeStatus::Standby,
        }
    }

    /// Apply a heartbeat report, upserting the node's record. Never accepts
    /// `led_pattern`/`audio_clip` from the device — `HeartbeatReport` has no
    /// such fields to accept.
    pub async fn upsert_node(&self, report: HeartbeatReport, status: NodeStatus) {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .entry(report.node_id.clone())
            .or_insert_with(|| Node::new(report.node_id.clone(), report.address.clone()));
        node.address = report.address;
        node.status = status;
        node.sensors = report.sensors;
        node.battery_level = report.battery_level;
        node.accelerometer_working = report.accelerometer_working;
        node.audio_working = report.audio_working;
        node.clock_skew_ms = report.clock_skew_ms;
        node.last_seen = Instant::now();
    }

    /// Register (or replace) the sender half used to push commands to this
    /// node's connection.
    pub async fn set_sender(&self, node_id: &str, sender: Option<NodeSender>) {
        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.sender = sender;
        }
    }

    /// Send a command to a node. Returns `false` (and nulls the sender) if
    /// the node has no live connection or the channel is closed.
    pub async fn send_command(&self, node_id: &str, command: Command) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(node) = inner.nodes.get_mut(node_id) else {
            return false;
        };
        match node.sender.as_ref().map(|s| s.send(command)) {
            Some(Ok(())) => true,
            Some(Err(_)) | None => {
                node.sender = None;
                false
            }
        }
    }

    /// Record the controller-commanded LED pattern / audio clip so
    /// convergence acks can resend it and chase-restore logic can read it
    /// back.
    pub async fn set_commanded_state(
        &self,
        node_id: &str,
        led_pattern: Option<String>,
        audio_clip: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.nodes.get_mut(node_id) {
            if led_pattern.is_some() {
                node.led_pattern = led_pattern;
            }
            if audio_clip.is_some() {
                node.audio_clip = audio_clip;
            }
        }
    }

    pub async fn commanded_led_pattern(&self, node_id: &str) -> Option<String> {
        self.inner.lock().await.nodes.get(node_id).and_then(|n| n.led_pattern.clone())
    }

    pub async fn commanded_audio_clip(&self, node_id: &str) -> Option<String> {
        self.inner.lock().await.nodes.get(node_id).and_then(|n| n.audio_clip.clone())
    }

    pub async fn assignment(&self, node_id: &str) -> Option<String> {
        self.inner.lock().await.assignments.get(node_id).cloned()
    }

    pub async fn course_status(&self) -> CourseStatus {
        self.inner.lock().await.course_status
    }

    pub async fn set_course(&self, status: CourseStatus, selected_course: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.course_status = status;
        inner.selected_course = selected_course;
    }

    pub async fn set_assignments(&self, assignments: HashMap<String, String>) {
        let mut inner = self.inner.lock().await;
        for (node_id, action) in &assignments {
            if let Some(node) = inner.nodes.get_mut(node_id) {
                node.assigned_action = Some(action.clone());
            }
        }
        inner.assignments = assignments;
    }

    pub async fn clear_assignments(&self) {
        let mut inner = self.inner.lock().await;
        let node_ids: Vec<String> = inner.assignments.keys().cloned().collect();
        for node_id in node_ids {
            if let Some(node) = inner.nodes.get_mut(&node_id) {
                node.assigned_action = None;
            }
        }
        inner.assignments.clear();
    }

    pub async fn assigned_node_ids(&self) -> Vec<String> {
        self.inner.lock().await.assignments.keys().cloned().collect()
    }

    /// A deep-copied snapshot suitable for the UI, taken while holding the
    /// lock only for the duration of the copy.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let mut nodes: Vec<NodeSnapshot> = inner
            .nodes
            .values()
            .map(|n| NodeSnapshot {
                node_id: n.node_id.clone(),
                address: n.address.clone(),
                status: format!("{:?}", n.status),
                battery_level: n.battery_level,
                led_pattern: n.led_pattern.clone(),
                audio_clip: n.audio_clip.clone(),
                assigned_action: n.assigned_action.clone(),
                clock_skew_ms: n.clock_skew_ms,
                last_seen_secs_ago: now.duration_since(n.last_seen).as_secs(),
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        RegistrySnapshot { course_status: inner.course_status, selected_course: inner.selected_course.clone(), nodes }
    }

    /// Periodically mark nodes offline after `offline_after` of heartbeat
    /// silence. Runs until `shutdown` is cancelled.
    pub async fn run_offline_sweep(&self, shutdown: CancellationToken) {
        info!("registry offline sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = shutdown.cancelled() => {
                    debug!("registry offline sweep shutting down");
                    return;
                }
            }
            let mut inner = self.inner.lock().await;
            let offline_after = self.offline_after;
            for node in inner.nodes.values_mut() {
                if node.status != NodeStatus::Offline && node.last_seen.elapsed() > offline_after {
                    node.status = NodeStatus::Offline;
                    node.sender = None;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
