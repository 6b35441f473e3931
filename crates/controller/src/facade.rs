// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Query/Command Facade (component I): the HTTP surface a coach's tablet or
//! laptop talks to. Every handler is a thin translation from JSON to a call
//! on the engine/course/registry/store; no orchestration logic lives here.
//!
//! Routes:
//!   POST   /teams                          team.create
//!   GET    /teams                          team.list
//!   POST   /teams/:id/athletes               athlete.create
//!   GET    /teams/:id/athletes               athlete.list
//!   POST   /sessions                       session.create
//!   POST   /sessions/:id/start              session.start
//!   POST   /sessions/:id/stop                session.stop
//!   POST   /sessions/:id/next-athlete        session.next_athlete
//!   GET    /sessions/:id/status              session.status
//!   POST   /sessions/:id/continue            session.continue
//!   POST   /sessions/:id/repeat              session.repeat
//!   POST   /courses/:name/deploy             course.deploy
//!   POST   /courses/activate                 course.activate
//!   POST   /courses/deactivate               course.deactivate
//!   GET    /registry/snapshot                registry.snapshot
//!   GET    /registry/logs                    registry.logs
//!   GET    /settings                         settings.list
//!   PUT    /settings/:key                    settings.set
//!   GET    /healthz                          liveness probe

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::registry::{Registry, RegistrySnapshot};
use crate::course::{ActivateOutcome, CourseLifecycle, DeployOutcome};
use crate::error::AppError;
use crate::oplog::{LogEntry, OperatorLog};
use crate::session::engine::{ContinueOutcome, SessionEngine, StatusView};
use crate::store::{Athlete, Store, Team};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub course: Arc<CourseLifecycle>,
    pub registry: Arc<Registry>,
    pub oplog: Arc<OperatorLog>,
    pub store: Arc<Store>,
}

/// Build the facade router. Cloning `state` is cheap: every field is an
/// `Arc` around a component that already guards its own interior mutation.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/teams", post(create_team).get(list_teams))
        .route("/teams/{id}/athletes", post(create_athlete).get(list_athletes))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/start", post(start_session))
        .route("/sessions/{id}/stop", post(stop_session))
        .route("/sessions/{id}/next-athlete", post(next_athlete))
        .route("/sessions/{id}/status", get(session_status))
        .route("/sessions/{id}/continue", post(continue_session))
        .route("/sessions/{id}/repeat", post(repeat_session))
        .route("/courses/{name}/deploy", post(deploy_course))
        .route("/courses/activate", post(activate_course))
        .route("/courses/deactivate", post(deactivate_course))
        .route("/registry/snapshot", get(registry_snapshot))
        .route("/registry/logs", get(registry_logs))
        .route("/settings", get(list_settings))
        .route("/settings/{key}", put(set_setting))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateTeamRequest {
    name: String,
    #[serde(default)]
    age_group: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTeamResponse {
    team_id: String,
}

async fn create_team(
    State(state): State<AppState>,
    Json(req): Json<CreateTeamRequest>,
) -> Result<Json<CreateTeamResponse>, AppError> {
    let team_id = state.store.create_team(req.name, req.age_group).await?;
    Ok(Json(CreateTeamResponse { team_id }))
}

async fn list_teams(State(state): State<AppState>) -> Result<Json<Vec<Team>>, AppError> {
    Ok(Json(state.store.list_teams().await?))
}

#[derive(Debug, Deserialize)]
struct CreateAthleteRequest {
    name: String,
    #[serde(default)]
    jersey_number: Option<String>,
    #[serde(default)]
    age: Option<i64>,
    #[serde(default)]
    position: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateAthleteResponse {
    athlete_id: String,
}

async fn create_athlete(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
    Json(req): Json<CreateAthleteRequest>,
) -> Result<Json<CreateAthleteResponse>, AppError> {
    let athlete_id = state.store.create_athlete(team_id, req.name, req.jersey_number, req.age, req.position).await?;
    Ok(Json(CreateAthleteResponse { athlete_id }))
}

async fn list_athletes(State(state): State<AppState>, Path(team_id): Path<String>) -> Result<Json<Vec<Athlete>>, AppError> {
    Ok(Json(state.store.list_athletes_for_team(team_id).await?))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    team_id: String,
    course_id: i64,
    athlete_ids: Vec<String>,
    #[serde(default = "default_audio_voice")]
    audio_voice: String,
    #[serde(default)]
    pattern_config: Option<Value>,
}

fn default_audio_voice() -> String {
    "default".to_owned()
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, AppError> {
    let session_id = state
        .store
        .create_session(req.team_id, req.course_id, req.athlete_ids, req.audio_voice, req.pattern_config)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn start_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.engine.start_session(id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct StopSessionRequest {
    #[serde(default = "default_stop_reason")]
    reason: String,
}

fn default_stop_reason() -> String {
    "operator stop".to_owned()
}

async fn stop_session(
    State(state): State<AppState>,
    Path(_id): Path<String>,
    body: Option<Json<StopSessionRequest>>,
) -> Result<StatusCode, AppError> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_else(default_stop_reason);
    state.engine.stop_session(reason).await?;
    Ok(StatusCode::OK)
}

async fn next_athlete(State(state): State<AppState>, Path(_id): Path<String>) -> Result<Json<StatusView>, AppError> {
    Ok(Json(state.engine.next_athlete().await?))
}

async fn session_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<StatusView>, AppError> {
    let status = state.engine.status().await;
    if status.session_id.as_deref() != Some(id.as_str()) {
        return Err(AppError::Constraint(format!("session {id} is not the active session")));
    }
    Ok(Json(status))
}

async fn continue_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContinueOutcome>, AppError> {
    Ok(Json(state.engine.continue_session(id).await?))
}

#[derive(Debug, Serialize)]
struct RepeatSessionResponse {
    session_id: String,
}

async fn repeat_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RepeatSessionResponse>, AppError> {
    let session_id = state.engine.repeat_session(id).await?;
    Ok(Json(RepeatSessionResponse { session_id }))
}

async fn deploy_course(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeployOutcome>, AppError> {
    Ok(Json(state.course.deploy(name).await?))
}

#[derive(Debug, Deserialize, Default)]
struct ActivateCourseRequest {
    #[serde(default)]
    course_name: Option<String>,
}

async fn activate_course(
    State(state): State<AppState>,
    body: Option<Json<ActivateCourseRequest>>,
) -> Result<Json<ActivateOutcome>, AppError> {
    let course_name = body.and_then(|Json(b)| b.course_name);
    Ok(Json(state.course.activate(course_name).await?))
}

async fn deactivate_course(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.course.deactivate().await?;
    Ok(StatusCode::OK)
}

async fn registry_snapshot(State(state): State<AppState>) -> Json<RegistrySnapshot> {
    Json(state.registry.snapshot().await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

async fn registry_logs(State(state): State<AppState>, Query(q): Query<LogsQuery>) -> Json<Vec<LogEntry>> {
    Json(state.oplog.recent(q.limit).await)
}

#[derive(Debug, Serialize)]
struct SettingEntry {
    key: String,
    value: String,
}

async fn list_settings(State(state): State<AppState>) -> Result<Json<Vec<SettingEntry>>, AppError> {
    let settings = state.store.all_settings().await?;
    Ok(Json(settings.into_iter().map(|(key, value)| SettingEntry { key, value }).collect()))
}

#[derive(Debug, Deserialize)]
struct SetSettingRequest {
    value: String,
}

async fn set_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<SetSettingRequest>,
) -> Result<StatusCode, AppError> {
    state.store.set_setting(key, req.value).await?;
    Ok(StatusCode::OK)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
