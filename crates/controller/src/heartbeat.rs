// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heartbeat Server (component D): a long-lived TCP listener accepting
//! persistent connections from cones, ingesting periodic state + touch
//! reports, and replying with commands that converge device state.
//!
//! Frames are newline-terminated JSON objects, UTF-8, no length prefix.
//! One task per accepted connection; touch dispatch is fanned out so the
//! read loop is never blocked.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::registry::{CourseStatus, HeartbeatReport, Registry};
use crate::clock::{self, Clock};
use crate::command::Command;
use crate::oplog::OperatorLog;
use crate::session::TouchDispatch;

/// Raw inbound heartbeat frame, per the wire protocol. No `led_pattern` or
/// `audio_clip` fields exist here by construction — LED/audio state flows
/// controller-to-device only, and a device that sends those fields anyway
/// simply has them ignored because this type cannot represent them.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatFrame {
    pub node_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub sensors: Option<serde_json::Value>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub accelerometer_working: Option<bool>,
    #[serde(default)]
    pub audio_working: Option<bool>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub touch_detected: bool,
    #[serde(default)]
    pub touch_timestamp: Option<f64>,
    #[serde(default)]
    pub clock_skew_ms: Option<i64>,
    #[serde(default)]
    pub first_connect: bool,
}

/// Outbound acknowledgement frame, per the wire protocol.
#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    pub ack: bool,
    pub action: Option<String>,
    pub course_status: CourseStatus,
    pub timestamp: String,
    pub master_time: i64,
    pub mesh_network: String,
    pub server_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub led_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_clip: Option<String>,
}

/// An error frame sent back when a cone's frame cannot be parsed.
#[derive(Debug, Clone, Serialize)]
struct ErrorFrame {
    error: String,
}

/// Configuration the heartbeat server needs from the top-level `Config`.
#[derive(Debug, Clone)]
pub struct HeartbeatServerConfig {
    pub mesh_ssid: String,
    pub server_version: String,
    pub read_timeout: Duration,
    pub clock_skew_threshold_ms: i64,
}

/// Handle to a running heartbeat server; dropping or cancelling its token
/// stops accepting new connections and cancels in-flight handlers.
pub struct HeartbeatServerHandle {
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl HeartbeatServerHandle {
    /// Stop accepting connections and cancel in-flight handlers. Resolves
    /// once the listener task has exited (handlers are given ~2s to unwind
    /// on their own select! branch before this returns).
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.join).await;
    }
}

/// Spawn the heartbeat server, bound to `addr`. Returns a handle once the
/// listener is bound; binding failure is an `Operational` error per the
/// error-kinds contract (the launcher exits non-zero).
pub async fn spawn(
    addr: SocketAddr,
    registry: Arc<Registry>,
    touch_tx: mpsc::Sender<TouchDispatch>,
    oplog: Arc<OperatorLog>,
    config: HeartbeatServerConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<HeartbeatServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("heartbeat listener failed to bind {addr}: {e}"))?;
    info!(%addr, "heartbeat server listening");

    let shutdown = CancellationToken::new();
    let accept_shutdown = shutdown.clone();
    let config = Arc::new(config);

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_shutdown.cancelled() => {
                    debug!("heartbeat server stopped accepting");
                    return;
                }
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let registry = registry.clone();
                    let touch_tx = touch_tx.clone();
                    let oplog = oplog.clone();
                    let config = config.clone();
                    let clock = clock.clone();
                    let conn_shutdown = accept_shutdown.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, registry, touch_tx, oplog, config, clock, conn_shutdown).await;
                    });
                }
            }
        }
    });

    Ok(HeartbeatServerHandle { shutdown, join })
}

fn tune_keepalive(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(5));
    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(3);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    touch_tx: mpsc::Sender<TouchDispatch>,
    oplog: Arc<OperatorLog>,
    config: Arc<HeartbeatServerConfig>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) {
    tune_keepalive(&stream);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut node_id: Option<String> = None;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

    loop {
        let mut line = String::new();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(%peer, "heartbeat connection cancelled");
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { continue };
                if write_frame(&mut write_half, &cmd).await.is_err() {
                    break;
                }
                continue;
            }
            read_result = tokio::time::timeout(config.read_timeout, reader.read_line(&mut line)) => {
                match read_result {
                    Err(_) => {
                        debug!(%peer, "heartbeat read deadline expired");
                        break;
                    }
                    Ok(Ok(0)) => {
                        debug!(%peer, "heartbeat connection closed by peer");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "heartbeat read error");
                        break;
                    }
                    Ok(Ok(_)) => {}
                }
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: HeartbeatFrame = match serde_json::from_str(trimmed) {
            Ok(f) => f,
            Err(e) => {
                warn!(%peer, error = %e, "malformed heartbeat frame");
                let _ = write_frame(&mut write_half, &ErrorFrame { error: format!("malformed frame: {e}") }).await;
                continue;
            }
        };

        let this_node_id = frame.node_id.clone().unwrap_or_else(|| peer.ip().to_string());
        if node_id.is_none() {
            node_id = Some(this_node_id.clone());
            registry.set_sender(&this_node_id, Some(cmd_tx.clone())).await;
        }

        let status = registry.derive_status(&this_node_id).await;
        let report = HeartbeatReport {
            node_id: this_node_id.clone(),
            address: peer.to_string(),
            status: frame.status.clone(),
            sensors: frame.sensors.clone(),
            battery_level: frame.battery_level,
            accelerometer_working: frame.accelerometer_working,
            audio_working: frame.audio_working,
            assigned_action_reported: frame.action.clone(),
            clock_skew_ms: frame.clock_skew_ms,
        };
        registry.upsert_node(report, status).await;

        if frame.touch_detected {
            if let Some(ts) = frame.touch_timestamp {
                let dispatch = TouchDispatch { node_id: this_node_id.clone(), timestamp: ts };
                if touch_tx.try_send(dispatch).is_err() {
                    warn!(node_id = %this_node_id, "touch dispatch queue full, dropping oldest-equivalent touch");
                }
            }
        }

        let needs_resync = frame.first_connect
            || frame.clock_skew_ms.map(|s| s.abs() > config.clock_skew_threshold_ms).unwrap_or(false);
        if needs_resync {
            oplog.push("info", "heartbeat", Some(&this_node_id), "clock resync requested").await;
        }

        let assignment = registry.assignment(&this_node_id).await;
        let course_status = registry.course_status().await;
        let led_pattern = registry.commanded_led_pattern(&this_node_id).await;
        let audio_clip = registry.commanded_audio_clip(&this_node_id).await;
        let now = clock.now_utc();
        let ack = AckFrame {
            ack: true,
            action: assignment,
            course_status,
            timestamp: clock::format_iso8601(now),
            master_time: clock::epoch_millis(now),
            mesh_network: config.mesh_ssid.clone(),
            server_version: config.server_version.clone(),
            led_pattern,
            audio_clip,
        };
        if write_frame(&mut write_half, &ack).await.is_err() {
            break;
        }
    }

    if let Some(node_id) = node_id {
        registry.set_sender(&node_id, None).await;
    }
}

async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_owned());
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
