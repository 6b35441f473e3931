// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Course Lifecycle (component F): the `Inactive -> Deployed -> Active`
//! state machine with `Active -> Deployed` permitted so cones sit at their
//! assigned colors between athletes in Sequential mode.
//!
//! Transitions are synchronous and best-effort: a cone that cannot be
//! reached is logged and skipped, never aborts the transition.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::broker::registry::{CourseStatus, Registry, CONTROLLER_NODE_ID};
use crate::command::{Command, LedPattern};
use crate::error::AppError;
use crate::local_output::LocalLed;
use crate::oplog::OperatorLog;
use crate::store::{Course, Store};

#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub course_name: String,
    pub assigned_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivateOutcome {
    pub notified_count: usize,
    pub total_assigned: usize,
}

pub struct CourseLifecycle {
    registry: Arc<Registry>,
    store: Arc<Store>,
    oplog: Arc<OperatorLog>,
    local_led: Arc<dyn LocalLed>,
}

impl CourseLifecycle {
    pub fn new(registry: Arc<Registry>, store: Arc<Store>, oplog: Arc<OperatorLog>, local_led: Arc<dyn LocalLed>) -> Self {
        Self { registry, store, oplog, local_led }
    }

    /// Deploy a course by name: stop and clear prior assignments, look up
    /// the course, build the new `device_id -> action` map, and send the
    /// deploy envelope to every non-controller cone.
    pub async fn deploy(&self, course_name: String) -> Result<DeployOutcome, AppError> {
        let course = self
            .store
            .get_course_by_name(course_name.clone())
            .await?
            .ok_or_else(|| AppError::Constraint(format!("unknown course: {course_name}")))?;

        for node_id in self.registry.assigned_node_ids().await {
            self.registry.send_command(&node_id, Command::stop(None)).await;
        }
        self.registry.clear_assignments().await;

        self.registry.set_course(CourseStatus::Deployed, Some(course.course_name.clone())).await;

        let mut assignments: HashMap<String, String> = HashMap::new();
        for action in &course.actions {
            assignments.insert(action.device_id.clone(), action.action.clone());
        }
        self.registry.set_assignments(assignments.clone()).await;

        let mut assigned_count = 0;
        for (device_id, action) in &assignments {
            if device_id == CONTROLLER_NODE_ID {
                continue;
            }
            if self.registry.send_command(device_id, Command::deploy(action.clone(), course.course_name.clone())).await {
                assigned_count += 1;
            } else {
                warn!(%device_id, "deploy: cone unreachable, continuing");
            }
        }

        self.oplog
            .push("info", "course", None, &format!("deployed '{}' to {assigned_count} cones", course.course_name))
            .await;
        info!(course = %course.course_name, assigned_count, "course deployed");

        Ok(DeployOutcome { course_name: course.course_name, assigned_count })
    }

    /// Activate the deployed course, or `course_name` if given (deploying it
    /// first when it isn't already the selected course).
    pub async fn activate(&self, course_name: Option<String>) -> Result<ActivateOutcome, AppError> {
        if let Some(name) = course_name {
            let snapshot = self.registry.snapshot().await;
            if snapshot.selected_course.as_deref() != Some(name.as_str()) {
                self.deploy(name).await?;
            }
        } else if self.registry.course_status().await == CourseStatus::Inactive {
            return Err(AppError::Constraint("no course deployed to activate".into()));
        }

        self.registry.set_course(CourseStatus::Active, self.registry.snapshot().await.selected_course).await;
        self.local_led.set(LedPattern::SolidGreen);

        let assigned = self.registry.assigned_node_ids().await;
        let mut notified_count = 0;
        for device_id in &assigned {
            if device_id == CONTROLLER_NODE_ID {
                continue;
            }
            if self.registry.send_command(device_id, Command::start()).await {
                notified_count += 1;
            } else {
                warn!(%device_id, "activate: cone unreachable, continuing");
            }
        }

        self.oplog.push("info", "course", None, &format!("activated, notified {notified_count}/{} cones", assigned.len())).await;
        info!(notified_count, total_assigned = assigned.len(), "course activated");

        Ok(ActivateOutcome { notified_count, total_assigned: assigned.len() })
    }

    /// Deactivate: stop all assigned cones, clear assignments, return to
    /// `Inactive`, and restore the controller's idle amber.
    pub async fn deactivate(&self) -> Result<(), AppError> {
        for device_id in self.registry.assigned_node_ids().await {
            if device_id == CONTROLLER_NODE_ID {
                continue;
            }
            self.registry.send_command(&device_id, Command::stop(Some(CourseStatus::Inactive))).await;
        }
        self.registry.clear_assignments().await;
        self.registry.set_course(CourseStatus::Inactive, None).await;
        self.local_led.set(LedPattern::SolidAmber);

        self.oplog.push("info", "course", None, "deactivated").await;
        info!("course deactivated");
        Ok(())
    }

    pub async fn get_course(&self, course_id: i64) -> Result<Option<Course>, AppError> {
        self.store.get_course(course_id).await
    }
}

#[cfg(test)]
#[path = "course_tests.rs"]
mod tests;
