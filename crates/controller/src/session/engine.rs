// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Session Engine proper (§4.G): session state, touch dispatch,
//! Sequential attribution (§4.G.4), and the Pattern-mode display/submit/
//! validate/advance flow (§4.G.5-9).
//!
//! The state mutex covers the full "categorize -> pick -> write -> record"
//! critical section required by §4.H. Animation sleeps and multi-frame
//! command fan-out always happen with the lock released; `error_feedback_active`
//! is set before release so a racing touch sees it and drops immediately
//! rather than blocking on the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::registry::{CourseStatus, Registry, CONTROLLER_NODE_ID};
use crate::clock::Clock;
use crate::command::{Command, LedPattern};
use crate::error::AppError;
use crate::local_output::{LocalAudio, LocalLed};
use crate::oplog::OperatorLog;
use crate::session::pattern::{generate, ColoredDevice, Pattern};
use crate::session::TouchDispatch;
use crate::store::{Course, CourseMode, Run, RunStatus, Session, Store};

/// Per-run live bookkeeping, recomputed from the Store on session start and
/// mutated in place as touches are attributed.
#[derive(Debug)]
struct RunInfo {
    run_id: String,
    athlete_id: String,
    queue_position: i64,
    sequence_position: i64,
    is_active: bool,
    pattern: Option<Pattern>,
    timer_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct PatternParams {
    sequence_length: usize,
    allow_repeats: bool,
}

impl Default for PatternParams {
    fn default() -> Self {
        Self { sequence_length: 4, allow_repeats: true }
    }
}

impl PatternParams {
    fn from_session(session: &Session) -> Self {
        let mut params = Self::default();
        let Some(cfg) = &session.pattern_config else { return params };
        if let Some(len) = cfg.get("sequence_length").and_then(|v| v.as_u64()) {
            params.sequence_length = len as usize;
        }
        if let Some(allow) = cfg.get("allow_repeats").and_then(|v| v.as_bool()) {
            params.allow_repeats = allow;
        }
        params
    }
}

struct EngineState {
    session_id: Option<String>,
    course_id: Option<i64>,
    course_mode: CourseMode,
    device_sequence: Vec<String>,
    colored_devices: Vec<ColoredDevice>,
    active_runs: HashMap<String, RunInfo>,
    error_feedback_active: bool,
    /// Global per-run debounce (§4.G.8 step 3): any device.
    last_touch_time: HashMap<String, Instant>,
    /// Per-step debounce (§4.G.8 step 4): keyed by `(run_id, device_id)`,
    /// recording when and at which expected position the device last fired.
    per_device_last_touch: HashMap<(String, String), (Instant, i64)>,
}

impl EngineState {
    fn empty() -> Self {
        Self {
            session_id: None,
            course_id: None,
            course_mode: CourseMode::Sequential,
            device_sequence: Vec::new(),
            colored_devices: Vec::new(),
            active_runs: HashMap::new(),
            error_feedback_active: false,
            last_touch_time: HashMap::new(),
            per_device_last_touch: HashMap::new(),
        }
    }

    fn new(session_id: String, course_id: i64, course_mode: CourseMode, device_sequence: Vec<String>, colored_devices: Vec<ColoredDevice>) -> Self {
        Self { session_id: Some(session_id), course_id: Some(course_id), course_mode, device_sequence, colored_devices, ..Self::empty() }
    }
}

/// Timing knobs sourced from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct EngineTimings {
    pub global_debounce: Duration,
    pub step_debounce: Duration,
    pub pattern_step_pause: Duration,
    pub pattern_success_pause: Duration,
    pub pattern_error_pause: Duration,
    pub pattern_stagger: Duration,
    pub pattern_advance_pause: Duration,
    pub max_concurrent_runs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRunView {
    pub run_id: String,
    pub athlete_id: String,
    pub sequence_position: i64,
    pub pattern_description: Option<String>,
    pub pattern_devices: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub session_id: Option<String>,
    pub course_mode: CourseMode,
    pub pattern_length: Option<usize>,
    pub active_runs: Vec<ActiveRunView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContinueOutcome {
    pub new_session_id: String,
    pub pattern_length: usize,
    pub athlete_count: usize,
}

/// The Session Engine, component G.
pub struct SessionEngine {
    store: Arc<Store>,
    registry: Arc<Registry>,
    oplog: Arc<OperatorLog>,
    local_audio: Arc<dyn LocalAudio>,
    local_led: Arc<dyn LocalLed>,
    clock: Arc<dyn Clock>,
    timings: EngineTimings,
    state: Mutex<EngineState>,
    rng: Mutex<StdRng>,
}

impl SessionEngine {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        oplog: Arc<OperatorLog>,
        local_audio: Arc<dyn LocalAudio>,
        local_led: Arc<dyn LocalLed>,
        clock: Arc<dyn Clock>,
        timings: EngineTimings,
    ) -> Self {
        let seed = clock.now_utc().timestamp_nanos_opt().unwrap_or(1) as u64;
        Self::with_seed(store, registry, oplog, local_audio, local_led, clock, timings, seed)
    }

    /// As [`SessionEngine::new`], but with an explicit RNG seed for
    /// deterministic pattern generation in tests (§8 property 8).
    pub fn with_seed(
        store: Arc<Store>,
        registry: Arc<Registry>,
        oplog: Arc<OperatorLog>,
        local_audio: Arc<dyn LocalAudio>,
        local_led: Arc<dyn LocalLed>,
        clock: Arc<dyn Clock>,
        timings: EngineTimings,
        seed: u64,
    ) -> Self {
        Self {
            store,
            registry,
            oplog,
            local_audio,
            local_led,
            clock,
            timings,
            state: Mutex::new(EngineState::empty()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub async fn status(&self) -> StatusView {
        let guard = self.state.lock().await;
        let mut active_runs: Vec<ActiveRunView> = guard
            .active_runs
            .values()
            .map(|i| ActiveRunView {
                run_id: i.run_id.clone(),
                athlete_id: i.athlete_id.clone(),
                sequence_position: i.sequence_position,
                pattern_description: i.pattern.as_ref().map(|p| p.description()),
                pattern_devices: i.pattern.as_ref().map(|p| p.device_ids()),
            })
            .collect();
        active_runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        let pattern_length = guard.active_runs.values().find(|i| i.is_active).and_then(|i| i.pattern.as_ref()).map(|p| p.len());
        StatusView { session_id: guard.session_id.clone(), course_mode: guard.course_mode, pattern_length, active_runs }
    }

    /// Drain `rx` until `shutdown` fires, dispatching each touch in turn.
    pub fn spawn_touch_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<TouchDispatch>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        return;
                    }
                    dispatch = rx.recv() => {
                        let Some(dispatch) = dispatch else { return };
                        self.handle_touch(dispatch.node_id, dispatch.timestamp).await;
                    }
                }
            }
        })
    }

    /// §4.G.3: top-level touch dispatch.
    pub async fn handle_touch(&self, node_id: String, timestamp_secs: f64) {
        let timestamp = seconds_to_datetime(timestamp_secs);
        let mode = {
            let guard = self.state.lock().await;
            if guard.session_id.is_none() {
                None
            } else {
                Some(guard.course_mode)
            }
        };
        let Some(mode) = mode else {
            self.oplog.push("debug", "session", Some(&node_id), "touch dropped: no active session").await;
            return;
        };

        if mode == CourseMode::Pattern && node_id == CONTROLLER_NODE_ID {
            self.pattern_submit(timestamp).await;
        } else if mode == CourseMode::Pattern {
            self.pattern_validate_step(node_id, timestamp).await;
        } else {
            self.sequential_attribute(node_id, timestamp).await;
        }
    }

    /// §4.G.2: start a session.
    pub async fn start_session(&self, session_id: String) -> Result<(), AppError> {
        self.store.start_session(session_id.clone()).await?;
        let first_run = self
            .store
            .get_next_queued_run(session_id.clone())
            .await?
            .ok_or_else(|| AppError::Constraint("session has no queued runs".into()))?;
        let now = self.clock.now_utc();
        self.store.start_run(first_run.run_id.clone(), now).await?;

        let course = self
            .store
            .get_course(first_run.course_id)
            .await?
            .ok_or_else(|| AppError::Constraint("session course not found".into()))?;
        let session = self
            .store
            .get_session(session_id.clone())
            .await?
            .ok_or_else(|| AppError::Constraint("session not found".into()))?;

        let device_sequence: Vec<String> =
            course.actions.iter().map(|a| a.device_id.clone()).filter(|d| d != CONTROLLER_NODE_ID).collect();
        let colored_devices = colored_devices_from(&course);
        let pattern_params = PatternParams::from_session(&session);

        match course.mode {
            CourseMode::Sequential => {
                self.store.create_segments_for_run(first_run.run_id.clone(), course.course_id).await?;

                let mut guard = self.state.lock().await;
                *guard = EngineState::new(session_id, course.course_id, CourseMode::Sequential, device_sequence, colored_devices);
                guard.active_runs.insert(
                    first_run.run_id.clone(),
                    RunInfo {
                        run_id: first_run.run_id.clone(),
                        athlete_id: first_run.athlete_id.clone(),
                        queue_position: first_run.queue_position,
                        sequence_position: -1,
                        is_active: true,
                        pattern: None,
                        timer_start: None,
                    },
                );
                drop(guard);

                if let Some(first_action) = course.actions.first() {
                    if let Some(audio) = &first_action.audio_file {
                        self.local_audio.play(audio);
                    }
                }
            }
            CourseMode::Pattern => {
                let runs = self.store.runs_for_session(session_id.clone()).await?;
                for run in &runs {
                    if run.run_id != first_run.run_id {
                        self.store.start_run(run.run_id.clone(), now).await?;
                    }
                }

                let mut generated: Vec<(Run, Pattern)> = Vec::with_capacity(runs.len());
                {
                    let mut rng = self.rng.lock().await;
                    let mut last_pattern: Option<Vec<ColoredDevice>> = None;
                    for run in &runs {
                        // `generate` already retries internally (up to 10
                        // attempts) against the immediately previous call's
                        // pattern per §4.G.5. This loop is the separate,
                        // wider budget from §4.G.2 step 6: avoid back-to-back
                        // athletes getting an identical pattern, up to 100
                        // attempts across distinct calls to `generate`.
                        let mut forced_repeats = false;
                        let mut pattern;
                        let mut back_to_back_attempts = 0;
                        loop {
                            let (candidate, forced) = generate(
                                &colored_devices,
                                pattern_params.sequence_length,
                                pattern_params.allow_repeats,
                                last_pattern.as_deref(),
                                &mut *rng,
                            )?;
                            pattern = candidate;
                            forced_repeats = forced;
                            back_to_back_attempts += 1;
                            let repeats_previous = last_pattern.as_deref().is_some_and(|last| pattern.repeats(last));
                            if !repeats_previous || back_to_back_attempts >= 100 {
                                break;
                            }
                        }
                        if forced_repeats {
                            warn!(run_id = %run.run_id, "pattern length exceeds colored device count, repeats forced");
                        }
                        last_pattern = Some(pattern.devices.clone());
                        generated.push((run.clone(), pattern));
                    }
                }

                for (run, pattern) in &generated {
                    self.store.create_pattern_segments_for_run(run.run_id.clone(), CONTROLLER_NODE_ID.to_owned(), pattern.device_ids()).await?;
                }

                let mut guard = self.state.lock().await;
                *guard = EngineState::new(session_id, course.course_id, CourseMode::Pattern, device_sequence, colored_devices);
                for (idx, (run, pattern)) in generated.into_iter().enumerate() {
                    guard.active_runs.insert(
                        run.run_id.clone(),
                        RunInfo {
                            run_id: run.run_id.clone(),
                            athlete_id: run.athlete_id.clone(),
                            queue_position: run.queue_position,
                            sequence_position: -1,
                            is_active: idx == 0,
                            pattern: Some(pattern),
                            timer_start: None,
                        },
                    );
                }
                drop(guard);

                if let Some(first) = runs.first() {
                    self.display_pattern(first.run_id.clone()).await;
                }
            }
        }
        Ok(())
    }

    /// §4.G.6: display a pattern, then start that athlete's completion timer.
    async fn display_pattern(&self, run_id: String) {
        self.local_audio.play("pattern_ready");

        let (pattern, description) = {
            let guard = self.state.lock().await;
            let Some(pattern) = guard.active_runs.get(&run_id).and_then(|r| r.pattern.clone()) else { return };
            let description = pattern.description();
            (pattern, description)
        };

        self.oplog.push("info", "session", Some(&run_id), &format!("pattern: {description}")).await;

        for device in &pattern.devices {
            if let Some(chase) = LedPattern::chase_for_color(&device.color) {
                self.registry.send_command(&device.device_id, Command::led(chase)).await;
            }
            tokio::time::sleep(self.timings.pattern_step_pause).await;
        }

        self.restore_assigned_colors(&pattern.devices).await;
        self.local_audio.play("go");

        let now = self.clock.now_utc();
        if self.store.update_run_timer_start(run_id.clone(), now).await.is_ok() {
            let mut guard = self.state.lock().await;
            if let Some(info) = guard.active_runs.get_mut(&run_id) {
                info.timer_start = Some(now);
            }
        }
    }

    async fn restore_assigned_colors(&self, devices: &[ColoredDevice]) {
        for device in devices {
            if let Some(solid) = LedPattern::solid_for_color(&device.color) {
                self.registry.set_commanded_state(&device.device_id, Some(solid.as_wire_str().to_owned()), None).await;
            }
        }
    }

    /// §4.G.7: the controller cone was touched while in Pattern mode.
    async fn pattern_submit(&self, timestamp: DateTime<Utc>) {
        let ready = {
            let guard = self.state.lock().await;
            if guard.error_feedback_active {
                return;
            }
            let Some((_, info)) = guard.active_runs.iter().find(|(_, i)| i.is_active) else { return };
            let Some(pattern) = &info.pattern else { return };
            info.sequence_position + 1 == pattern.len() as i64
        };

        let run_id = {
            let guard = self.state.lock().await;
            let Some((run_id, _)) = guard.active_runs.iter().find(|(_, i)| i.is_active) else { return };
            run_id.clone()
        };

        if !ready {
            self.oplog.push("debug", "session", Some(&run_id), "pattern submit ignored: steps remain").await;
            return;
        }

        self.local_audio.play("success");
        {
            let mut guard = self.state.lock().await;
            guard.error_feedback_active = true;
        }

        let colored: Vec<ColoredDevice> = {
            let guard = self.state.lock().await;
            guard.active_runs.get(&run_id).and_then(|i| i.pattern.as_ref()).map(|p| p.devices.clone()).unwrap_or_default()
        };

        for device in &colored {
            self.registry.send_command(&device.device_id, Command::led(LedPattern::ChaseGreen)).await;
            tokio::time::sleep(self.timings.pattern_stagger).await;
        }
        tokio::time::sleep(self.timings.pattern_success_pause).await;
        self.restore_assigned_colors(&colored).await;

        {
            let mut guard = self.state.lock().await;
            guard.error_feedback_active = false;
        }

        let timer_start = {
            let guard = self.state.lock().await;
            guard.active_runs.get(&run_id).and_then(|i| i.timer_start)
        };
        let completion_time = timer_start.map(|t| (timestamp - t).num_milliseconds() as f64 / 1000.0);

        if self.store.complete_run(run_id.clone(), timestamp, completion_time, RunStatus::Completed).await.is_err() {
            return;
        }
        info!(%run_id, "pattern submitted successfully");
        self.advance_or_complete(&run_id).await;
    }

    /// §4.G.8: a colored cone was touched while in Pattern mode.
    async fn pattern_validate_step(&self, device_id: String, timestamp: DateTime<Utc>) {
        let now_instant = Instant::now();

        enum Outcome {
            Ignored,
            Correct { run_id: String, expected_position: i64, pattern_len: i64 },
            Wrong { run_id: String, expected: ColoredDevice },
        }

        let outcome = {
            let mut guard = self.state.lock().await;
            if guard.error_feedback_active {
                Outcome::Ignored
            } else if let Some(run_id) = guard.active_runs.iter().find(|(_, i)| i.is_active).map(|(id, _)| id.clone()) {
                let debounced_globally = guard
                    .last_touch_time
                    .get(&run_id)
                    .is_some_and(|last| now_instant.duration_since(*last) < self.timings.global_debounce);

                if debounced_globally {
                    Outcome::Ignored
                } else {
                    let info = match guard.active_runs.get(&run_id) {
                        Some(info) => info,
                        None => return,
                    };
                    let expected_position = info.sequence_position + 1;
                    let pattern_len = info.pattern.as_ref().map(|p| p.len() as i64).unwrap_or(0);
                    let expected_device = info.pattern.as_ref().and_then(|p| p.devices.get(expected_position as usize)).cloned();

                    let step_key = (run_id.clone(), device_id.clone());
                    let step_debounced = guard.per_device_last_touch.get(&step_key).is_some_and(|(last, pos)| {
                        now_instant.duration_since(*last) < self.timings.step_debounce && *pos == expected_position
                    });

                    if step_debounced || expected_position >= pattern_len || expected_device.is_none() {
                        Outcome::Ignored
                    } else {
                        let expected_device = match expected_device {
                            Some(d) => d,
                            None => return,
                        };
                        guard.last_touch_time.insert(run_id.clone(), now_instant);
                        guard.per_device_last_touch.insert(step_key, (now_instant, expected_position));

                        if expected_device.device_id == device_id {
                            if let Some(info) = guard.active_runs.get_mut(&run_id) {
                                info.sequence_position = expected_position;
                            }
                            Outcome::Correct { run_id, expected_position, pattern_len }
                        } else {
                            Outcome::Wrong { run_id, expected: expected_device }
                        }
                    }
                }
            } else {
                Outcome::Ignored
            }
        };

        match outcome {
            Outcome::Ignored => {}
            Outcome::Correct { run_id, expected_position, pattern_len } => {
                let _ = self.store.record_touch(run_id.clone(), device_id, timestamp).await;
                if expected_position + 1 == pattern_len {
                    self.oplog.push("info", "session", Some(&run_id), "final step touched, submit at start device").await;
                }
            }
            Outcome::Wrong { run_id, expected } => {
                self.oplog
                    .push(
                        "warn",
                        "session",
                        Some(&device_id),
                        &format!("wrong step: expected {} ({}), touched {device_id}", expected.device_id, expected.color),
                    )
                    .await;
                self.run_error_feedback(run_id, timestamp).await;
            }
        }
    }

    async fn run_error_feedback(&self, run_id: String, timestamp: DateTime<Utc>) {
        {
            let mut guard = self.state.lock().await;
            guard.error_feedback_active = true;
        }

        let colored: Vec<ColoredDevice> = {
            let guard = self.state.lock().await;
            guard.active_runs.get(&run_id).and_then(|i| i.pattern.as_ref()).map(|p| p.devices.clone()).unwrap_or_default()
        };

        for device in &colored {
            self.registry.send_command(&device.device_id, Command::led(LedPattern::ChaseRed)).await;
            tokio::time::sleep(self.timings.pattern_stagger).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.local_audio.play("error");
        tokio::time::sleep(self.timings.pattern_error_pause).await;
        self.restore_assigned_colors(&colored).await;

        {
            let mut guard = self.state.lock().await;
            guard.error_feedback_active = false;
        }

        let timer_start = {
            let guard = self.state.lock().await;
            guard.active_runs.get(&run_id).and_then(|i| i.timer_start)
        };
        let completion_time = timer_start.map(|t| (timestamp - t).num_milliseconds() as f64 / 1000.0);

        if self.store.complete_run(run_id.clone(), timestamp, completion_time, RunStatus::Incomplete).await.is_err() {
            return;
        }
        self.advance_or_complete(&run_id).await;
    }

    /// §4.G.9: move to the next waiting athlete, or complete the session.
    async fn advance_or_complete(&self, finished_run_id: &str) {
        let (next_run_id, colored_devices) = {
            let mut guard = self.state.lock().await;
            guard.active_runs.remove(finished_run_id);
            let next = guard.active_runs.iter().filter(|(_, i)| !i.is_active).min_by_key(|(_, i)| i.queue_position).map(|(id, _)| id.clone());
            (next, guard.colored_devices.clone())
        };

        let Some(next_run_id) = next_run_id else {
            self.complete_session_internal().await;
            return;
        };

        self.restore_assigned_colors(&colored_devices).await;
        tokio::time::sleep(self.timings.pattern_advance_pause).await;

        {
            let mut guard = self.state.lock().await;
            if let Some(info) = guard.active_runs.get_mut(&next_run_id) {
                info.is_active = true;
            }
        }

        self.display_pattern(next_run_id).await;
    }

    /// `session.next_athlete` (§4.I): pattern mode only. Manually advances
    /// past the currently active run without requiring the triggering
    /// touch, for when implicit advance can't fire (a broken sensor, a
    /// cone that dropped off the mesh mid-pattern). Treated as a
    /// successful completion of that run, mirroring [`Self::pattern_submit`]'s
    /// completion tail minus the step-validation check and success chase.
    pub async fn next_athlete(&self) -> Result<StatusView, AppError> {
        let (mode, run_id) = {
            let guard = self.state.lock().await;
            (guard.course_mode, guard.active_runs.iter().find(|(_, i)| i.is_active).map(|(id, _)| id.clone()))
        };
        if mode != CourseMode::Pattern {
            return Err(AppError::Constraint("next_athlete is only valid in pattern mode".into()));
        }
        let Some(run_id) = run_id else {
            return Err(AppError::Constraint("no active run to advance".into()));
        };

        let timer_start = {
            let guard = self.state.lock().await;
            guard.active_runs.get(&run_id).and_then(|i| i.timer_start)
        };
        let now = self.clock.now_utc();
        let completion_time = timer_start.map(|t| (now - t).num_milliseconds() as f64 / 1000.0);

        self.store.complete_run(run_id.clone(), now, completion_time, RunStatus::Completed).await?;
        self.oplog.push("info", "session", Some(&run_id), "manually advanced to next athlete").await;
        self.advance_or_complete(&run_id).await;
        Ok(self.status().await)
    }

    /// §4.G.4: attribute and record a Sequential-mode touch.
    async fn sequential_attribute(&self, device_id: String, timestamp: DateTime<Utc>) {
        let picked = {
            let mut guard = self.state.lock().await;
            let Some(device_position) = guard.device_sequence.iter().position(|d| *d == device_id).map(|p| p as i64) else {
                drop(guard);
                self.oplog.push("debug", "session", Some(&device_id), "touch rejected: unknown device").await;
                return;
            };

            let mut priority1: Vec<(String, i64)> = Vec::new();
            let mut priority2: Vec<(String, i64, i64)> = Vec::new();
            for (run_id, info) in guard.active_runs.iter() {
                let gap = device_position - info.sequence_position;
                if gap <= 0 {
                    continue;
                }
                if gap == 1 {
                    priority1.push((run_id.clone(), info.queue_position));
                } else {
                    priority2.push((run_id.clone(), gap, info.queue_position));
                }
            }

            let chosen_id = if !priority1.is_empty() {
                priority1.sort_by_key(|(_, qp)| *qp);
                priority1.into_iter().next().map(|(id, _)| id)
            } else if !priority2.is_empty() {
                priority2.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
                priority2.into_iter().next().map(|(id, _, _)| id)
            } else {
                None
            };

            let Some(run_id) = chosen_id else {
                drop(guard);
                self.oplog.push("debug", "session", Some(&device_id), "touch rejected: no eligible active run").await;
                return;
            };

            let prior_position = guard.active_runs.get(&run_id).map(|i| i.sequence_position).unwrap_or(-1);
            if let Some(info) = guard.active_runs.get_mut(&run_id) {
                info.sequence_position = device_position;
            }
            (run_id, prior_position, device_position, guard.course_id)
        };

        let (run_id, prior_position, device_position, course_id) = picked;
        let course = match course_id {
            Some(id) => self.store.get_course(id).await.ok().flatten(),
            None => None,
        };

        if device_position - prior_position > 1 {
            if let Some(course) = &course {
                for skipped in (prior_position + 1)..device_position {
                    if let Some(action) = course.actions.iter().find(|a| a.sequence == skipped) {
                        if let Ok(Some(segment_id)) = self.store.find_open_segment_id(run_id.clone(), action.device_id.clone()).await {
                            let _ = self.store.mark_segment_missed(segment_id).await;
                        }
                    }
                }
            }
        }

        let segment_id = match self.store.record_touch(run_id.clone(), device_id.clone(), timestamp).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                self.oplog.push("warn", "session", Some(&device_id), &format!("record_touch failed: {e}")).await;
                return;
            }
        };
        let _ = self.store.check_segment_alerts(segment_id).await;

        let Some(course) = course else { return };
        let Some(action) = course.actions.iter().find(|a| a.device_id == device_id).cloned() else { return };

        if action.triggers_next_athlete {
            self.maybe_start_next_run(&course).await;
        }
        if action.marks_run_complete {
            self.complete_sequential_run(&run_id, timestamp).await;
        }
    }

    async fn maybe_start_next_run(&self, course: &Course) {
        let (session_id, active_count) = {
            let guard = self.state.lock().await;
            (guard.session_id.clone(), guard.active_runs.len())
        };
        let Some(session_id) = session_id else { return };
        if active_count >= self.timings.max_concurrent_runs {
            return;
        }
        let Ok(Some(next_run)) = self.store.get_next_queued_run(session_id).await else { return };
        if self.store.start_run(next_run.run_id.clone(), self.clock.now_utc()).await.is_err() {
            return;
        }
        if self.store.create_segments_for_run(next_run.run_id.clone(), course.course_id).await.is_err() {
            return;
        }

        {
            let mut guard = self.state.lock().await;
            guard.active_runs.insert(
                next_run.run_id.clone(),
                RunInfo {
                    run_id: next_run.run_id.clone(),
                    athlete_id: next_run.athlete_id.clone(),
                    queue_position: next_run.queue_position,
                    sequence_position: -1,
                    is_active: true,
                    pattern: None,
                    timer_start: None,
                },
            );
        }

        if let Some(first_action) = course.actions.first() {
            if let Some(audio) = &first_action.audio_file {
                self.local_audio.play(audio);
            }
        }
    }

    async fn complete_sequential_run(&self, run_id: &str, timestamp: DateTime<Utc>) {
        let segments = self.store.segments_for_run(run_id.to_owned()).await.unwrap_or_default();
        let total_time: f64 = segments.iter().filter_map(|s| s.actual_time).sum();
        if self.store.complete_run(run_id.to_owned(), timestamp, Some(total_time), RunStatus::Completed).await.is_err() {
            return;
        }

        let (all_done, session_id) = {
            let mut guard = self.state.lock().await;
            guard.active_runs.remove(run_id);
            (guard.active_runs.is_empty(), guard.session_id.clone())
        };

        if !all_done {
            return;
        }
        let Some(session_id) = session_id else { return };
        if self.store.get_next_queued_run(session_id).await.ok().flatten().is_none() {
            self.complete_session_internal().await;
        }
    }

    /// Shared tail of §4.G.9 (no next athlete) and §4.G.4 step 10: mark the
    /// session completed, return the course to `Deployed`, and amber every
    /// assigned cone plus the controller's own LED.
    async fn complete_session_internal(&self) {
        let session_id = {
            let guard = self.state.lock().await;
            guard.session_id.clone()
        };
        let Some(session_id) = session_id else { return };
        if self.store.complete_session(session_id.clone()).await.is_err() {
            return;
        }

        let selected_course = self.registry.snapshot().await.selected_course;
        self.registry.set_course(CourseStatus::Deployed, selected_course).await;
        for device_id in self.registry.assigned_node_ids().await {
            if device_id == CONTROLLER_NODE_ID {
                continue;
            }
            self.registry.send_command(&device_id, Command::stop(Some(CourseStatus::Deployed))).await;
            self.registry.set_commanded_state(&device_id, Some(LedPattern::SolidAmber.as_wire_str().to_owned()), None).await;
        }
        self.registry.clear_assignments().await;
        self.local_led.set(LedPattern::SolidAmber);

        let mut guard = self.state.lock().await;
        *guard = EngineState::empty();
        drop(guard);

        self.oplog.push("info", "session", None, &format!("session {session_id} completed")).await;
    }

    /// §4.G.10: stop the active session on coach request.
    pub async fn stop_session(&self, reason: String) -> Result<(), AppError> {
        let session_id = {
            let guard = self.state.lock().await;
            guard.session_id.clone()
        };
        let Some(session_id) = session_id else {
            return Err(AppError::Constraint("no active session to stop".into()));
        };

        self.store.stop_session(session_id.clone(), reason).await?;

        let selected_course = self.registry.snapshot().await.selected_course;
        self.registry.set_course(CourseStatus::Deployed, selected_course).await;
        for device_id in self.registry.assigned_node_ids().await {
            if device_id == CONTROLLER_NODE_ID {
                continue;
            }
            self.registry.send_command(&device_id, Command::stop(Some(CourseStatus::Deployed))).await;
            self.registry.set_commanded_state(&device_id, Some(LedPattern::SolidAmber.as_wire_str().to_owned()), None).await;
        }
        self.registry.clear_assignments().await;
        self.local_led.set(LedPattern::SolidAmber);

        let mut guard = self.state.lock().await;
        *guard = EngineState::empty();
        drop(guard);

        self.oplog.push("info", "session", None, &format!("session {session_id} stopped")).await;
        Ok(())
    }

    /// `session.continue`: a new session with only the successful athletes,
    /// `sequence_length + 1` clamped to 8.
    pub async fn continue_session(&self, session_id: String) -> Result<ContinueOutcome, AppError> {
        let session = self.store.get_session(session_id.clone()).await?.ok_or_else(|| AppError::Constraint("session not found".into()))?;
        let runs = self.store.runs_for_session(session_id).await?;
        let athlete_ids: Vec<String> = runs.iter().filter(|r| r.status == RunStatus::Completed).map(|r| r.athlete_id.clone()).collect();
        if athlete_ids.is_empty() {
            return Err(AppError::Constraint("no successful athletes to continue with".into()));
        }

        let params = PatternParams::from_session(&session);
        let bumped_length = (params.sequence_length + 1).min(8);
        let pattern_config = serde_json::json!({ "sequence_length": bumped_length, "allow_repeats": params.allow_repeats });
        let athlete_count = athlete_ids.len();

        let new_session_id =
            self.store.create_session(session.team_id, session.course_id, athlete_ids, session.audio_voice, Some(pattern_config)).await?;
        Ok(ContinueOutcome { new_session_id, pattern_length: bumped_length, athlete_count })
    }

    /// `session.repeat`: the same athletes (minus those marked absent), same
    /// course, same pattern configuration.
    pub async fn repeat_session(&self, session_id: String) -> Result<String, AppError> {
        let session = self.store.get_session(session_id.clone()).await?.ok_or_else(|| AppError::Constraint("session not found".into()))?;
        let runs = self.store.runs_for_session(session_id).await?;
        let athlete_ids: Vec<String> = runs.iter().filter(|r| r.status != RunStatus::Absent).map(|r| r.athlete_id.clone()).collect();
        self.store.create_session(session.team_id, session.course_id, athlete_ids, session.audio_voice, session.pattern_config.clone()).await
    }
}

fn colored_devices_from(course: &Course) -> Vec<ColoredDevice> {
    course
        .actions
        .iter()
        .filter(|a| a.device_id != CONTROLLER_NODE_ID)
        .filter_map(|a| {
            let color = a.behavior_config.as_ref()?.get("color")?.as_str()?.to_owned();
            Some(ColoredDevice { device_id: a.device_id.clone(), device_name: a.device_name.clone().unwrap_or_else(|| a.device_id.clone()), color })
        })
        .collect()
}

fn seconds_to_datetime(secs: f64) -> DateTime<Utc> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs.fract()) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole, nanos).unwrap_or_else(Utc::now)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
