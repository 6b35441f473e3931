// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Store (component B): transactional persistent state over a relational
//! schema with FK cascade, UNIQUE constraints, and a write-ahead log.
//!
//! `rusqlite` is synchronous; callers run operations through
//! [`Store::call`], which moves the connection handle onto a blocking
//! thread via `spawn_blocking`. A single `Arc<Mutex<Connection>>` serializes
//! writers while WAL lets readers proceed against the same file — adequate
//! at this system's scale (at most ~16 devices, single site).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::AppError;

const SCHEMA: &str = include_str!("schema.sql");

const RETRY_DELAYS_MS: [u64; 5] = [100, 200, 300, 400, 500];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseMode {
    Sequential,
    Pattern,
}

impl CourseMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Pattern => "pattern",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pattern" => Self::Pattern,
            _ => Self::Sequential,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Setup,
    Active,
    Completed,
    Incomplete,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "completed" => Self::Completed,
            "incomplete" => Self::Incomplete,
            _ => Self::Setup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Incomplete,
    Dropped,
    Absent,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Dropped => "dropped",
            Self::Absent => "absent",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "incomplete" => Self::Incomplete,
            "dropped" => Self::Dropped,
            "absent" => Self::Absent,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertType {
    MissedTouch,
    TooFast,
    TooSlow,
}

impl AlertType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::MissedTouch => "missed_touch",
            Self::TooFast => "too_fast",
            Self::TooSlow => "too_slow",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "missed_touch" => Some(Self::MissedTouch),
            "too_fast" => Some(Self::TooFast),
            "too_slow" => Some(Self::TooSlow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub team_id: String,
    pub name: String,
    pub age_group: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Athlete {
    pub athlete_id: String,
    pub team_id: String,
    pub name: String,
    pub jersey_number: Option<String>,
    pub age: Option<i64>,
    pub position: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseAction {
    pub action_id: i64,
    pub course_id: i64,
    pub sequence: i64,
    pub device_id: String,
    pub device_name: Option<String>,
    pub action: String,
    pub action_type: Option<String>,
    pub audio_file: Option<String>,
    pub instruction: Option<String>,
    pub min_time: f64,
    pub max_time: f64,
    pub triggers_next_athlete: bool,
    pub marks_run_complete: bool,
    pub group_identifier: Option<String>,
    pub behavior_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseActionInput {
    pub sequence: i64,
    pub device_id: String,
    pub device_name: Option<String>,
    pub action: String,
    pub action_type: Option<String>,
    pub audio_file: Option<String>,
    pub instruction: Option<String>,
    pub min_time: f64,
    pub max_time: f64,
    pub triggers_next_athlete: bool,
    pub marks_run_complete: bool,
    pub group_identifier: Option<String>,
    pub behavior_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub course_id: i64,
    pub course_name: String,
    pub description: Option<String>,
    pub course_type: String,
    pub mode: CourseMode,
    pub category: Option<String>,
    pub total_devices: i64,
    pub actions: Vec<CourseAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub team_id: String,
    pub course_id: i64,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub audio_voice: String,
    pub pattern_config: Option<serde_json::Value>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub session_id: String,
    pub athlete_id: String,
    pub course_id: i64,
    pub queue_position: i64,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub timer_start_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: i64,
    pub run_id: String,
    pub sequence: i64,
    pub from_device: String,
    pub to_device: String,
    pub expected_min_time: f64,
    pub expected_max_time: f64,
    pub actual_time: Option<f64>,
    pub cumulative_time: Option<f64>,
    pub touch_detected: bool,
    pub touch_timestamp: Option<DateTime<Utc>>,
    pub alert_raised: bool,
    pub alert_type: Option<AlertType>,
}

/// Aggregate counts for the operator dashboard landing view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_teams: i64,
    pub total_athletes: i64,
    pub total_courses: i64,
    pub total_sessions: i64,
    pub completed_runs: i64,
    pub active_sessions: i64,
}

/// One completed run, newest first, for the dashboard's activity feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub run_id: String,
    pub athlete_name: String,
    pub course_name: String,
    pub status: RunStatus,
    pub total_time: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One athlete's best completed time on a course, for the rankings view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingEntry {
    pub athlete_id: String,
    pub athlete_name: String,
    pub best_time: f64,
    pub run_count: i64,
}

/// Persistent store, component B.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`, apply the
    /// schema, set WAL journal mode, and configure the busy timeout.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let path = path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(Duration::from_secs(20))?;
            conn.execute_batch(SCHEMA)?;
            seed_default_settings(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> anyhow::Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(SCHEMA)?;
            seed_default_settings(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a closure against the connection on a blocking thread. A single
    /// mutex serializes all access; WAL lets this remain simple at this
    /// system's scale without a connection pool.
    async fn call<F, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await
        .map_err(|e| AppError::Operational(format!("store task panicked: {e}")))?
        .map_err(classify)
    }

    /// Retry a fallible write with the standard 100/200/300/400/500 ms
    /// backoff on `Transient` errors, per the concurrency model.
    async fn with_retry<F, T>(&self, mut f: F) -> Result<T, AppError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T> + Send + Clone + 'static,
        T: Send + 'static,
    {
        for delay_ms in RETRY_DELAYS_MS {
            let f = f.clone();
            match self.call(f).await {
                Ok(v) => return Ok(v),
                Err(AppError::Transient(msg)) => {
                    warn!(%msg, delay_ms, "store operation locked, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(other) => return Err(other),
            }
        }
        let f2 = f.clone();
        self.call(f2).await
    }

    pub async fn create_course(
        &self,
        name: String,
        description: Option<String>,
        course_type: String,
        mode: CourseMode,
        category: Option<String>,
        total_devices: i64,
        actions: Vec<CourseActionInput>,
    ) -> Result<i64, AppError> {
        let mut seqs: Vec<i64> = actions.iter().map(|a| a.sequence).collect();
        seqs.sort_unstable();
        let dense = seqs.iter().enumerate().all(|(i, &s)| s == i as i64);
        if !seqs.is_empty() && !dense {
            return Err(AppError::Constraint("course actions must have dense, unique sequence numbers from 0".into()));
        }

        self.call(move |conn| {
            let course_id = {
                let mut stmt = conn.prepare(
                    "INSERT INTO courses (course_name, description, course_type, mode, category, total_devices)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                stmt.execute(params![name, description, course_type, mode.as_str(), category, total_devices])?;
                conn.last_insert_rowid()
            };
            for a in &actions {
                conn.execute(
                    "INSERT INTO course_actions (
                        course_id, sequence, device_id, device_name, action, action_type,
                        audio_file, instruction, min_time, max_time, triggers_next_athlete,
                        marks_run_complete, group_identifier, behavior_config
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                    params![
                        course_id,
                        a.sequence,
                        a.device_id,
                        a.device_name,
                        a.action,
                        a.action_type,
                        a.audio_file,
                        a.instruction,
                        a.min_time,
                        a.max_time,
                        a.triggers_next_athlete,
                        a.marks_run_complete,
                        a.group_identifier,
                        a.behavior_config.as_ref().map(|v| v.to_string()),
                    ],
                )?;
            }
            Ok(course_id)
        })
        .await
    }

    pub async fn get_course(&self, course_id: i64) -> Result<Option<Course>, AppError> {
        self.call(move |conn| read_course(conn, course_id)).await
    }

    pub async fn get_course_by_name(&self, name: String) -> Result<Option<Course>, AppError> {
        self.call(move |conn| {
            let id: Option<i64> = conn
                .query_row("SELECT course_id FROM courses WHERE course_name = ?1", params![name], |r| r.get(0))
                .optional()?;
            match id {
                Some(id) => read_course(conn, id),
                None => Ok(None),
            }
        })
        .await
    }

    /// Copy a course and all of its actions under a uniquified name
    /// (`"{name} (copy)"`, `"{name} (copy 2)"`, ...), returning the new
    /// course's id.
    pub async fn duplicate_course(&self, course_id: i64) -> Result<i64, AppError> {
        self.call(move |conn| {
            let Some(course) = read_course(conn, course_id)? else {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            };

            let mut candidate = format!("{} (copy)", course.course_name);
            let mut n = 2;
            loop {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM courses WHERE course_name = ?1",
                    params![candidate],
                    |r| r.get(0),
                )?;
                if exists == 0 {
                    break;
                }
                candidate = format!("{} (copy {})", course.course_name, n);
                n += 1;
            }

            let new_course_id = {
                let mut stmt = conn.prepare(
                    "INSERT INTO courses (course_name, description, course_type, mode, category, total_devices)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                stmt.execute(params![
                    candidate,
                    course.description,
                    course.course_type,
                    course.mode.as_str(),
                    course.category,
                    course.total_devices,
                ])?;
                conn.last_insert_rowid()
            };
            for a in &course.actions {
                conn.execute(
                    "INSERT INTO course_actions (
                        course_id, sequence, device_id, device_name, action, action_type,
                        audio_file, instruction, min_time, max_time, triggers_next_athlete,
                        marks_run_complete, group_identifier, behavior_config
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                    params![
                        new_course_id,
                        a.sequence,
                        a.device_id,
                        a.device_name,
                        a.action,
                        a.action_type,
                        a.audio_file,
                        a.instruction,
                        a.min_time,
                        a.max_time,
                        a.triggers_next_athlete,
                        a.marks_run_complete,
                        a.group_identifier,
                        a.behavior_config.as_ref().map(|v| v.to_string()),
                    ],
                )?;
            }
            Ok(new_course_id)
        })
        .await
    }

    /// Create a team, returning its generated id.
    pub async fn create_team(&self, name: String, age_group: Option<String>) -> Result<String, AppError> {
        let team_id = crate::clock::new_id();
        let tid = team_id.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO teams (team_id, name, age_group, active) VALUES (?1, ?2, ?3, 1)",
                params![tid, name, age_group],
            )?;
            Ok(())
        })
        .await?;
        Ok(team_id)
    }

    /// Create an athlete under an existing team, returning its generated id.
    pub async fn create_athlete(
        &self,
        team_id: String,
        name: String,
        jersey_number: Option<String>,
        age: Option<i64>,
        position: Option<String>,
    ) -> Result<String, AppError> {
        let athlete_id = crate::clock::new_id();
        let aid = athlete_id.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO athletes (athlete_id, team_id, name, jersey_number, age, position, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![aid, team_id, name, jersey_number, age, position],
            )?;
            Ok(())
        })
        .await?;
        Ok(athlete_id)
    }

    pub async fn list_teams(&self) -> Result<Vec<Team>, AppError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT team_id, name, age_group, active FROM teams ORDER BY name")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(Team { team_id: r.get(0)?, name: r.get(1)?, age_group: r.get(2)?, active: r.get::<_, i64>(3)? != 0 })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_athletes_for_team(&self, team_id: String) -> Result<Vec<Athlete>, AppError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT athlete_id, team_id, name, jersey_number, age, position, active
                 FROM athletes WHERE team_id = ?1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map(params![team_id], |r| {
                    Ok(Athlete {
                        athlete_id: r.get(0)?,
                        team_id: r.get(1)?,
                        name: r.get(2)?,
                        jersey_number: r.get(3)?,
                        age: r.get(4)?,
                        position: r.get(5)?,
                        active: r.get::<_, i64>(6)? != 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn create_session(
        &self,
        team_id: String,
        course_id: i64,
        athlete_ids: Vec<String>,
        audio_voice: String,
        pattern_config: Option<serde_json::Value>,
    ) -> Result<String, AppError> {
        let session_id = crate::clock::new_id();
        let sid = session_id.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, team_id, course_id, status, audio_voice, pattern_config)
                 VALUES (?1, ?2, ?3, 'setup', ?4, ?5)",
                params![sid, team_id, course_id, audio_voice, pattern_config.as_ref().map(|v| v.to_string())],
            )?;
            for (idx, athlete_id) in athlete_ids.iter().enumerate() {
                let run_id = crate::clock::new_id();
                conn.execute(
                    "INSERT INTO runs (run_id, session_id, athlete_id, course_id, queue_position, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'queued')",
                    params![run_id, sid, athlete_id, course_id, idx as i64],
                )?;
            }
            Ok(())
        })
        .await?;
        Ok(session_id)
    }

    pub async fn start_session(&self, session_id: String) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute("UPDATE sessions SET status = 'active' WHERE session_id = ?1", params![session_id])?;
            Ok(())
        })
        .await
    }

    pub async fn get_next_queued_run(&self, session_id: String) -> Result<Option<Run>, AppError> {
        self.call(move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT run_id FROM runs WHERE session_id = ?1 AND status = 'queued'
                     ORDER BY queue_position ASC LIMIT 1",
                    params![session_id],
                    |r| r.get(0),
                )
                .optional()?;
            match id {
                Some(id) => read_run(conn, &id),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn start_run(&self, run_id: String, timestamp: DateTime<Utc>) -> Result<(), AppError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET status = 'running', started_at = ?2 WHERE run_id = ?1 AND status = 'queued'",
                params![run_id, timestamp.to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            Ok(())
        })
        .await
    }

    pub async fn update_run_timer_start(&self, run_id: String, timestamp: DateTime<Utc>) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE runs SET timer_start_at = ?2 WHERE run_id = ?1",
                params![run_id, timestamp.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn complete_run(
        &self,
        run_id: String,
        timestamp: DateTime<Utc>,
        total_time: Option<f64>,
        status: RunStatus,
    ) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE runs SET status = ?2, completed_at = ?3, total_time = ?4 WHERE run_id = ?1",
                params![run_id, status.as_str(), timestamp.to_rfc3339(), total_time],
            )?;
            Ok(())
        })
        .await
    }

    /// Sequential mode: one segment per adjacent device pair, using the
    /// course's min/max time. Idempotent on the `(run_id, sequence)` UNIQUE
    /// constraint: if segments already exist, this is a no-op.
    pub async fn create_segments_for_run(&self, run_id: String, course_id: i64) -> Result<(), AppError> {
        self.call(move |conn| {
            let existing: i64 =
                conn.query_row("SELECT COUNT(*) FROM segments WHERE run_id = ?1", params![run_id], |r| r.get(0))?;
            if existing > 0 {
                return Ok(());
            }
            let Some(course) = read_course(conn, course_id)? else {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            };
            let devices: Vec<&CourseAction> = course.actions.iter().collect();
            for pair in devices.windows(2) {
                let (from, to) = (&pair[0], &pair[1]);
                conn.execute(
                    "INSERT INTO segments (run_id, sequence, from_device, to_device, expected_min_time, expected_max_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![run_id, to.sequence, from.device_id, to.device_id, to.min_time, to.max_time],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Pattern mode: one segment per step, threaded from `start_device`
    /// through the chosen pattern, with sentinel min/max times. Idempotent
    /// like [`Store::create_segments_for_run`].
    pub async fn create_pattern_segments_for_run(
        &self,
        run_id: String,
        start_device: String,
        pattern_device_ids: Vec<String>,
    ) -> Result<(), AppError> {
        self.call(move |conn| {
            let existing: i64 =
                conn.query_row("SELECT COUNT(*) FROM segments WHERE run_id = ?1", params![run_id], |r| r.get(0))?;
            if existing > 0 {
                return Ok(());
            }
            let mut from = start_device.clone();
            for (idx, to) in pattern_device_ids.iter().enumerate() {
                conn.execute(
                    "INSERT INTO segments (run_id, sequence, from_device, to_device, expected_min_time, expected_max_time)
                     VALUES (?1, ?2, ?3, ?4, 0.0, 999.9)",
                    params![run_id, idx as i64, from, to],
                )?;
                from = to.clone();
            }
            Ok(())
        })
        .await
    }

    /// Atomically find the earliest not-yet-touched segment whose
    /// `to_device == device_id`, mark it touched, and compute timing.
    /// Retries on transient lock errors per the concurrency model.
    pub async fn record_touch(
        &self,
        run_id: String,
        device_id: String,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<i64>, AppError> {
        self.with_retry(move |conn| {
            let run_id = run_id.clone();
            let device_id = device_id.clone();
            record_touch_tx(conn, &run_id, &device_id, timestamp)
        })
        .await
    }

    /// Look up the open (not-yet-touched) segment feeding `to_device` for a
    /// run, without marking it touched. Used to resolve the segment id for a
    /// skipped step before calling [`Store::mark_segment_missed`].
    pub async fn find_open_segment_id(&self, run_id: String, to_device: String) -> Result<Option<i64>, AppError> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT segment_id FROM segments WHERE run_id = ?1 AND to_device = ?2 AND touch_detected = 0
                 ORDER BY sequence ASC LIMIT 1",
                params![run_id, to_device],
                |r| r.get(0),
            )
            .optional()
        })
        .await
    }

    pub async fn mark_segment_missed(&self, segment_id: i64) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE segments SET alert_raised = 1, alert_type = 'missed_touch' WHERE segment_id = ?1",
                params![segment_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Re-reads `actual_time` for `segment_id` and compares it to the
    /// segment's expected bounds. A no-op for pattern-mode segments, whose
    /// sentinel bounds (0.0, 999.9) can never be violated.
    pub async fn check_segment_alerts(&self, segment_id: i64) -> Result<(), AppError> {
        self.with_retry(move |conn| {
            let row: Option<(f64, f64, Option<f64>)> = conn
                .query_row(
                    "SELECT expected_min_time, expected_max_time, actual_time FROM segments WHERE segment_id = ?1",
                    params![segment_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((min_t, max_t, actual)) = row else { return Ok(()) };
            let Some(actual) = actual else { return Ok(()) };
            if actual < min_t {
                conn.execute(
                    "UPDATE segments SET alert_raised = 1, alert_type = 'too_fast' WHERE segment_id = ?1",
                    params![segment_id],
                )?;
            } else if actual > max_t {
                conn.execute(
                    "UPDATE segments SET alert_raised = 1, alert_type = 'too_slow' WHERE segment_id = ?1",
                    params![segment_id],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_active_session(&self) -> Result<Option<Session>, AppError> {
        self.call(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT session_id FROM sessions WHERE status IN ('setup', 'active') ORDER BY created_at DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            match id {
                Some(id) => read_session(conn, &id),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn get_session(&self, session_id: String) -> Result<Option<Session>, AppError> {
        self.call(move |conn| read_session(conn, &session_id)).await
    }

    pub async fn get_run(&self, run_id: String) -> Result<Option<Run>, AppError> {
        self.call(move |conn| read_run(conn, &run_id)).await
    }

    pub async fn runs_for_session(&self, session_id: String) -> Result<Vec<Run>, AppError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, session_id, athlete_id, course_id, queue_position, status,
                        started_at, timer_start_at, completed_at, total_time
                 FROM runs WHERE session_id = ?1 ORDER BY queue_position",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_run)?;
            rows.collect()
        })
        .await
    }

    pub async fn segments_for_run(&self, run_id: String) -> Result<Vec<Segment>, AppError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT segment_id, run_id, sequence, from_device, to_device, expected_min_time,
                        expected_max_time, actual_time, cumulative_time, touch_detected,
                        touch_timestamp, alert_raised, alert_type
                 FROM segments WHERE run_id = ?1 ORDER BY sequence",
            )?;
            let rows = stmt.query_map(params![run_id], row_to_segment)?;
            rows.collect()
        })
        .await
    }

    /// On startup, recover from a crash while a session was active (§7
    /// process-restart policy): any session still `active`, and every run
    /// of it still `running`, transitions to `incomplete`.
    pub async fn recover_incomplete_sessions(&self) -> Result<Vec<String>, AppError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT session_id FROM sessions WHERE status = 'active'")?;
            let ids: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<_>>()?;
            for id in &ids {
                conn.execute(
                    "UPDATE sessions SET status = 'incomplete', notes = 'System restart during active session'
                     WHERE session_id = ?1",
                    params![id],
                )?;
                conn.execute(
                    "UPDATE runs SET status = 'incomplete' WHERE session_id = ?1 AND status = 'running'",
                    params![id],
                )?;
            }
            Ok(ids)
        })
        .await
    }

    pub async fn stop_session(&self, session_id: String, reason: String) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE runs SET status = 'incomplete' WHERE session_id = ?1 AND status = 'running'",
                params![session_id],
            )?;
            conn.execute(
                "UPDATE sessions SET status = 'incomplete', notes = ?2, completed_at = CURRENT_TIMESTAMP WHERE session_id = ?1",
                params![session_id, reason],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn complete_session(&self, session_id: String) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE sessions SET status = 'completed', completed_at = CURRENT_TIMESTAMP WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_setting(&self, key: String) -> Result<Option<String>, AppError> {
        self.call(move |conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0)).optional()
        })
        .await
    }

    pub async fn set_setting(&self, key: String, value: String) -> Result<(), AppError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn all_settings(&self) -> Result<Vec<(String, String)>, AppError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect()
        })
        .await
    }

    /// Roster/course/session counts for the dashboard landing view.
    pub async fn dashboard_stats(&self) -> Result<DashboardStats, AppError> {
        self.call(|conn| {
            let total_teams: i64 = conn.query_row("SELECT COUNT(*) FROM teams", [], |r| r.get(0))?;
            let total_athletes: i64 = conn.query_row("SELECT COUNT(*) FROM athletes", [], |r| r.get(0))?;
            let total_courses: i64 = conn.query_row("SELECT COUNT(*) FROM courses", [], |r| r.get(0))?;
            let total_sessions: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
            let completed_runs: i64 =
                conn.query_row("SELECT COUNT(*) FROM runs WHERE status = 'completed'", [], |r| r.get(0))?;
            let active_sessions: i64 =
                conn.query_row("SELECT COUNT(*) FROM sessions WHERE status = 'active'", [], |r| r.get(0))?;
            Ok(DashboardStats { total_teams, total_athletes, total_courses, total_sessions, completed_runs, active_sessions })
        })
        .await
    }

    /// Most recently completed runs, newest first.
    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>, AppError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.run_id, a.name, c.course_name, r.status, r.total_time, r.completed_at
                 FROM runs r
                 JOIN athletes a ON a.athlete_id = r.athlete_id
                 JOIN courses c ON c.course_id = r.course_id
                 WHERE r.completed_at IS NOT NULL
                 ORDER BY r.completed_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    let completed_at: Option<String> = row.get(5)?;
                    Ok(ActivityEntry {
                        run_id: row.get(0)?,
                        athlete_name: row.get(1)?,
                        course_name: row.get(2)?,
                        status: RunStatus::parse(&row.get::<_, String>(3)?),
                        total_time: row.get(4)?,
                        completed_at: completed_at
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|d| d.with_timezone(&Utc)),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Per-athlete best completed time on a course, ascending (fastest
    /// first), suitable for a personal-record leaderboard.
    pub async fn course_rankings(&self, course_id: i64, limit: i64) -> Result<Vec<RankingEntry>, AppError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.athlete_id, a.name, MIN(r.total_time) AS best_time, COUNT(*) AS run_count
                 FROM runs r
                 JOIN athletes a ON a.athlete_id = r.athlete_id
                 WHERE r.course_id = ?1 AND r.status = 'completed' AND r.total_time IS NOT NULL
                 GROUP BY r.athlete_id, a.name
                 ORDER BY best_time ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![course_id, limit], |row| {
                    Ok(RankingEntry {
                        athlete_id: row.get(0)?,
                        athlete_name: row.get(1)?,
                        best_time: row.get(2)?,
                        run_count: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Raw connection access for seeding rows Store's public API has no
    /// constructor for (teams, athletes). Test-only, crate-visible so the
    /// session engine's tests can seed fixtures without duplicating schema
    /// knowledge.
    #[cfg(test)]
    pub(crate) fn conn_for_test(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

fn record_touch_tx(
    conn: &Connection,
    run_id: &str,
    device_id: &str,
    timestamp: DateTime<Utc>,
) -> rusqlite::Result<Option<i64>> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT segment_id, sequence FROM segments
             WHERE run_id = ?1 AND to_device = ?2 AND touch_detected = 0
             ORDER BY sequence ASC LIMIT 1",
            params![run_id, device_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((segment_id, sequence)) = row else { return Ok(None) };

    let prev_touch_ts: Option<String> = if sequence == 0 {
        None
    } else {
        conn.query_row(
            "SELECT touch_timestamp FROM segments WHERE run_id = ?1 AND sequence = ?2",
            params![run_id, sequence - 1],
            |r| r.get(0),
        )
        .optional()?
        .flatten()
    };

    let reference: DateTime<Utc> = match prev_touch_ts {
        Some(ts) => DateTime::parse_from_rfc3339(&ts).map(|d| d.with_timezone(&Utc)).unwrap_or(timestamp),
        None => {
            let started_at: Option<String> =
                conn.query_row("SELECT started_at FROM runs WHERE run_id = ?1", params![run_id], |r| r.get(0))?;
            match started_at {
                Some(ts) => DateTime::parse_from_rfc3339(&ts).map(|d| d.with_timezone(&Utc)).unwrap_or(timestamp),
                None => timestamp,
            }
        }
    };
    let actual_time = (timestamp - reference).num_milliseconds() as f64 / 1000.0;

    let timer_start: Option<String> =
        conn.query_row("SELECT timer_start_at FROM runs WHERE run_id = ?1", params![run_id], |r| r.get(0))?;
    let cumulative_time = timer_start.and_then(|ts| {
        DateTime::parse_from_rfc3339(&ts)
            .ok()
            .map(|d| (timestamp - d.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0)
    });

    conn.execute(
        "UPDATE segments SET touch_detected = 1, touch_timestamp = ?2, actual_time = ?3, cumulative_time = ?4
         WHERE segment_id = ?1",
        params![segment_id, timestamp.to_rfc3339(), actual_time, cumulative_time],
    )?;

    Ok(Some(segment_id))
}

fn read_course(conn: &Connection, course_id: i64) -> rusqlite::Result<Option<Course>> {
    let row: Option<(String, Option<String>, String, String, Option<String>, i64)> = conn
        .query_row(
            "SELECT course_name, description, course_type, mode, category, total_devices
             FROM courses WHERE course_id = ?1",
            params![course_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()?;
    let Some((course_name, description, course_type, mode, category, total_devices)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT action_id, course_id, sequence, device_id, device_name, action, action_type,
                audio_file, instruction, min_time, max_time, triggers_next_athlete,
                marks_run_complete, group_identifier, behavior_config
         FROM course_actions WHERE course_id = ?1 ORDER BY sequence",
    )?;
    let actions = stmt
        .query_map(params![course_id], |r| {
            let behavior_config: Option<String> = r.get(14)?;
            Ok(CourseAction {
                action_id: r.get(0)?,
                course_id: r.get(1)?,
                sequence: r.get(2)?,
                device_id: r.get(3)?,
                device_name: r.get(4)?,
                action: r.get(5)?,
                action_type: r.get(6)?,
                audio_file: r.get(7)?,
                instruction: r.get(8)?,
                min_time: r.get(9)?,
                max_time: r.get(10)?,
                triggers_next_athlete: r.get(11)?,
                marks_run_complete: r.get(12)?,
                group_identifier: r.get(13)?,
                behavior_config: behavior_config.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(Course {
        course_id,
        course_name,
        description,
        course_type,
        mode: CourseMode::parse(&mode),
        category,
        total_devices,
        actions,
    }))
}

fn read_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        "SELECT session_id, team_id, course_id, status, started_at, completed_at, audio_voice,
                pattern_config, notes
         FROM sessions WHERE session_id = ?1",
        params![session_id],
        |r| {
            let pattern_config: Option<String> = r.get(7)?;
            let started_at: Option<String> = r.get(4)?;
            let completed_at: Option<String> = r.get(5)?;
            Ok(Session {
                session_id: r.get(0)?,
                team_id: r.get(1)?,
                course_id: r.get(2)?,
                status: SessionStatus::parse(&r.get::<_, String>(3)?),
                started_at: started_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                completed_at: completed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
                audio_voice: r.get(6)?,
                pattern_config: pattern_config.and_then(|s| serde_json::from_str(&s).ok()),
                notes: r.get(8)?,
            })
        },
    )
    .optional()
}

fn row_to_run(r: &rusqlite::Row) -> rusqlite::Result<Run> {
    let started_at: Option<String> = r.get(6)?;
    let timer_start_at: Option<String> = r.get(7)?;
    let completed_at: Option<String> = r.get(8)?;
    Ok(Run {
        run_id: r.get(0)?,
        session_id: r.get(1)?,
        athlete_id: r.get(2)?,
        course_id: r.get(3)?,
        queue_position: r.get(4)?,
        status: RunStatus::parse(&r.get::<_, String>(5)?),
        started_at: started_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        timer_start_at: timer_start_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        completed_at: completed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        total_time: r.get(9)?,
    })
}

fn read_run(conn: &Connection, run_id: &str) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        "SELECT run_id, session_id, athlete_id, course_id, queue_position, status,
                started_at, timer_start_at, completed_at, total_time
         FROM runs WHERE run_id = ?1",
        params![run_id],
        row_to_run,
    )
    .optional()
}

fn row_to_segment(r: &rusqlite::Row) -> rusqlite::Result<Segment> {
    let touch_timestamp: Option<String> = r.get(10)?;
    let alert_type: Option<String> = r.get(12)?;
    Ok(Segment {
        segment_id: r.get(0)?,
        run_id: r.get(1)?,
        sequence: r.get(2)?,
        from_device: r.get(3)?,
        to_device: r.get(4)?,
        expected_min_time: r.get(5)?,
        expected_max_time: r.get(6)?,
        actual_time: r.get(7)?,
        cumulative_time: r.get(8)?,
        touch_detected: r.get(9)?,
        touch_timestamp: touch_timestamp.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        alert_raised: r.get(11)?,
        alert_type: alert_type.and_then(|s| AlertType::parse(&s)),
    })
}

fn seed_default_settings(conn: &Connection) -> rusqlite::Result<()> {
    const DEFAULTS: &[(&str, &str)] = &[
        ("distance_unit", "meters"),
        ("voice_gender", "male"),
        ("system_volume", "80"),
        ("ready_audio_file", "ready"),
        ("min_travel_time", "1.0"),
        ("max_travel_time", "30.0"),
        ("ready_led_color", "amber"),
        ("ready_audio_target", "controller"),
        ("wifi_ssid", "ft_mesh"),
        ("wifi_password", ""),
    ];
    for (key, value) in DEFAULTS {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }
    Ok(())
}

fn classify(err: rusqlite::Error) -> AppError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) => match e.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                AppError::Transient(msg.clone().unwrap_or_else(|| "database is locked".into()))
            }
            rusqlite::ErrorCode::ConstraintViolation => {
                AppError::Constraint(msg.clone().unwrap_or_else(|| "constraint violation".into()))
            }
            _ => AppError::Operational(err.to_string()),
        },
        rusqlite::Error::QueryReturnedNoRows => AppError::Constraint("not found".into()),
        _ => AppError::Operational(err.to_string()),
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
