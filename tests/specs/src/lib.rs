// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `field-controller` binary as a subprocess and drives it
//! the way a cone and a coach's tablet would: raw heartbeat frames over TCP,
//! and JSON calls against the query/command facade.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Resolve the path to the compiled `field-controller` binary.
pub fn field_controller_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("field-controller")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `field-controller` process, killed on drop. Its database file
/// lives in a temp dir that is cleaned up alongside it.
pub struct ControllerProcess {
    child: Child,
    heartbeat_port: u16,
    facade_port: u16,
    db_path: PathBuf,
    _db_dir: tempfile::TempDir,
}

/// Builder for a [`ControllerProcess`].
pub struct ControllerBuilder {
    fast_timings: bool,
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self { fast_timings: true }
    }
}

impl ControllerBuilder {
    /// Use the binary's production default timings instead of the harness's
    /// fast overrides. Pattern-mode display animations will then take
    /// several seconds each, as they do for a real cone fleet.
    pub fn real_timings(mut self) -> Self {
        self.fast_timings = false;
        self
    }

    pub fn spawn(self) -> anyhow::Result<ControllerProcess> {
        let binary = field_controller_binary();
        anyhow::ensure!(binary.exists(), "field-controller binary not found at {}", binary.display());

        let heartbeat_port = free_port()?;
        let facade_port = free_port()?;
        let db_dir = tempfile::tempdir()?;
        let db_path = db_dir.path().join("controller.sqlite3");

        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--heartbeat-port".into(),
            heartbeat_port.to_string(),
            "--facade-port".into(),
            facade_port.to_string(),
            "--db-path".into(),
            db_path.to_string_lossy().into_owned(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];

        if self.fast_timings {
            // Pattern-mode display animations and debounce windows are real
            // wall-clock sleeps; shrink them so a scenario test finishes in
            // well under a second instead of the production ~5s per step.
            args.extend([
                "--pattern-step-pause-ms".into(),
                "5".into(),
                "--pattern-success-pause-ms".into(),
                "5".into(),
                "--pattern-error-pause-ms".into(),
                "5".into(),
                "--pattern-stagger-ms".into(),
                "5".into(),
                "--pattern-advance-pause-ms".into(),
                "5".into(),
                "--global-debounce-ms".into(),
                "60".into(),
                "--step-debounce-ms".into(),
                "80".into(),
            ]);
        }

        let child = Command::new(&binary).args(&args).stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;

        Ok(ControllerProcess { child, heartbeat_port, facade_port, db_path, _db_dir: db_dir })
    }
}

impl ControllerProcess {
    pub fn build() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn heartbeat_port(&self) -> u16 {
        self.heartbeat_port
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.facade_port)
    }

    /// Poll `/healthz` until the facade answers or `timeout` elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/healthz", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("field-controller did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll `/sessions/{id}/status` until `predicate` returns true, or bail
    /// once `timeout` elapses.
    pub async fn wait_for_status<F>(&self, session_id: &str, timeout: Duration, predicate: F) -> anyhow::Result<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/sessions/{session_id}/status", self.base_url());
        loop {
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    let body: Value = resp.json().await?;
                    if predicate(&body) {
                        return Ok(body);
                    }
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("status for session {session_id} did not satisfy predicate within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for ControllerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A fake cone: a raw TCP connection to the heartbeat port that speaks the
/// newline-terminated JSON heartbeat protocol directly. One connection can
/// stand in for an entire fleet, since the server keys each frame's
/// identity off that frame's own `node_id` rather than the connection.
pub struct FakeCone {
    stream: BufReader<TcpStream>,
}

impl FakeCone {
    pub async fn connect(heartbeat_port: u16) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", heartbeat_port)).await?;
        Ok(Self { stream: BufReader::new(stream) })
    }

    async fn send(&mut self, frame: Value) -> anyhow::Result<Value> {
        let mut line = frame.to_string();
        line.push('\n');
        self.stream.get_mut().write_all(line.as_bytes()).await?;
        let mut resp = String::new();
        self.stream.read_line(&mut resp).await?;
        Ok(serde_json::from_str(resp.trim())?)
    }

    /// Send an idle heartbeat (no touch), registering or refreshing presence.
    pub async fn heartbeat(&mut self, node_id: &str) -> anyhow::Result<Value> {
        self.send(json!({"node_id": node_id, "status": "idle", "touch_detected": false})).await
    }

    /// Send a heartbeat reporting a touch at `touch_timestamp` (seconds
    /// since epoch, used only for segment timing, never for debounce).
    pub async fn touch(&mut self, node_id: &str, touch_timestamp: f64) -> anyhow::Result<Value> {
        self.send(json!({
            "node_id": node_id,
            "status": "idle",
            "touch_detected": true,
            "touch_timestamp": touch_timestamp,
        }))
        .await
    }
}
