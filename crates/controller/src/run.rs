// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config & Bootstrap (component J): wires every component together and
//! drives the process lifecycle — startup recovery, server spawn, and
//! graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::registry::Registry;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::course::CourseLifecycle;
use crate::facade::{self, AppState};
use crate::heartbeat::{self, HeartbeatServerConfig};
use crate::local_output::{NoopAudio, NoopLed};
use crate::oplog::OperatorLog;
use crate::session::engine::{EngineTimings, SessionEngine};
use crate::store::Store;

/// Everything a running controller owns, kept around so tests and `main`
/// can wait on its servers or trigger shutdown directly.
pub struct RunningController {
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub engine: Arc<SessionEngine>,
    pub oplog: Arc<OperatorLog>,
    shutdown: CancellationToken,
    heartbeat: heartbeat::HeartbeatServerHandle,
    facade: tokio::task::JoinHandle<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningController {
    /// Cancel every spawned task and wait for the servers to wind down.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.heartbeat.stop().await;
        let _ = self.facade.await;
        for task in self.background {
            let _ = task.await;
        }
    }
}

/// Initialize tracing from config. Uses `try_init` so it is safe to call
/// more than once, e.g. across integration tests in the same process.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

fn engine_timings(config: &Config) -> EngineTimings {
    EngineTimings {
        global_debounce: Duration::from_millis(config.global_debounce_ms),
        step_debounce: Duration::from_millis(config.step_debounce_ms),
        pattern_step_pause: Duration::from_millis(config.pattern_step_pause_ms),
        pattern_success_pause: Duration::from_millis(config.pattern_success_pause_ms),
        pattern_error_pause: Duration::from_millis(config.pattern_error_pause_ms),
        pattern_stagger: Duration::from_millis(config.pattern_stagger_ms),
        pattern_advance_pause: Duration::from_millis(config.pattern_advance_pause_ms),
        max_concurrent_runs: config.max_concurrent_runs,
    }
}

/// Bring up the whole controller: open the store, run startup recovery,
/// then spawn the heartbeat server, the registry's offline sweep, the
/// touch-dispatch consumer, and the facade HTTP server.
///
/// Startup recovery runs to completion before the heartbeat listener binds,
/// so no cone's first heartbeat can race a session the recovery scan hasn't
/// yet settled.
pub async fn prepare(config: Config) -> anyhow::Result<RunningController> {
    init_tracing(&config);

    let store = Arc::new(Store::open(&config.db_path).await?);

    let recovered = store.recover_incomplete_sessions().await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), sessions = ?recovered, "recovered incomplete sessions from a prior restart");
    }

    let registry = Arc::new(Registry::new(Duration::from_secs(config.offline_after_secs)));
    let oplog = Arc::new(OperatorLog::new(config.operator_log_capacity));
    let clock = Arc::new(SystemClock);

    let engine = Arc::new(SessionEngine::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&oplog),
        Arc::new(NoopAudio),
        Arc::new(NoopLed),
        clock.clone(),
        engine_timings(&config),
    ));
    let course = Arc::new(CourseLifecycle::new(Arc::clone(&registry), Arc::clone(&store), Arc::clone(&oplog), Arc::new(NoopLed)));

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    background.push(tokio::spawn({
        let registry = Arc::clone(&registry);
        let shutdown = shutdown.child_token();
        async move { registry.run_offline_sweep(shutdown).await }
    }));

    let (touch_tx, touch_rx) = mpsc::channel(256);
    background.push(Arc::clone(&engine).spawn_touch_consumer(touch_rx, shutdown.child_token()));

    let heartbeat_addr: SocketAddr = format!("{}:{}", config.host, config.heartbeat_port).parse()?;
    let heartbeat = heartbeat::spawn(
        heartbeat_addr,
        Arc::clone(&registry),
        touch_tx,
        Arc::clone(&oplog),
        HeartbeatServerConfig {
            mesh_ssid: config.mesh_ssid.clone(),
            server_version: config.server_version.clone(),
            read_timeout: Duration::from_secs(config.heartbeat_read_timeout_secs),
            clock_skew_threshold_ms: config.clock_skew_threshold_ms,
        },
        clock,
    )
    .await?;

    let state = AppState { engine: Arc::clone(&engine), course, registry: Arc::clone(&registry), oplog: Arc::clone(&oplog), store: Arc::clone(&store) };
    let facade_addr: SocketAddr = format!("{}:{}", config.host, config.facade_port).parse()?;
    let facade_listener = TcpListener::bind(facade_addr).await?;
    info!(addr = %facade_addr, "facade listening");
    let facade = tokio::spawn({
        let shutdown = shutdown.child_token();
        async move {
            let result = axum::serve(facade_listener, facade::router(state)).with_graceful_shutdown(shutdown.cancelled_owned()).await;
            if let Err(e) = result {
                error!(error = %e, "facade server error");
            }
        }
    });

    oplog.push("info", "bootstrap", None, "controller started").await;

    Ok(RunningController { store, registry, engine, oplog, shutdown, heartbeat, facade, background })
}

/// Run the controller until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let controller = prepare(config).await?;
    wait_for_shutdown_signal().await;
    controller.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

    tokio::select! {
        _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
            info!("received SIGTERM");
        }
        _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
            info!("received SIGINT");
        }
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
