// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Central controller for a fleet of networked training cones.
#[derive(Debug, Parser, Clone)]
#[command(name = "field-controller", version, about)]
pub struct Config {
    /// TCP port the heartbeat server listens on.
    #[arg(long, env = "FTC_HEARTBEAT_PORT", default_value = "9000")]
    pub heartbeat_port: u16,

    /// HTTP port the query/command facade listens on.
    #[arg(long, env = "FTC_FACADE_PORT", default_value = "8080")]
    pub facade_port: u16,

    /// Host address to bind both listeners to.
    #[arg(long, env = "FTC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Path to the SQLite database file.
    #[arg(long, env = "FTC_DB_PATH", default_value = "./field_controller.sqlite3")]
    pub db_path: PathBuf,

    /// Mesh network label echoed in heartbeat acknowledgements.
    #[arg(long, env = "FTC_MESH_SSID", default_value = "ft_mesh")]
    pub mesh_ssid: String,

    /// Server version string echoed in heartbeat acknowledgements.
    #[arg(long, env = "FTC_SERVER_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub server_version: String,

    /// Maximum number of Sequential-mode runs active at once.
    #[arg(long, env = "FTC_MAX_CONCURRENT_RUNS", default_value = "5")]
    pub max_concurrent_runs: usize,

    /// Capacity of the in-memory operator log ring buffer.
    #[arg(long, env = "FTC_OPERATOR_LOG_CAPACITY", default_value = "1000")]
    pub operator_log_capacity: usize,

    /// Per-connection read deadline in seconds before a cone is considered gone.
    #[arg(long, env = "FTC_HEARTBEAT_READ_TIMEOUT_SECS", default_value = "45")]
    pub heartbeat_read_timeout_secs: u64,

    /// Seconds of heartbeat silence before a node's status flips to offline.
    #[arg(long, env = "FTC_OFFLINE_AFTER_SECS", default_value = "15")]
    pub offline_after_secs: u64,

    /// Clock skew, in milliseconds, that triggers a resync request.
    #[arg(long, env = "FTC_CLOCK_SKEW_THRESHOLD_MS", default_value = "250")]
    pub clock_skew_threshold_ms: i64,

    /// Global debounce window for pattern-mode touches, in milliseconds.
    #[arg(long, env = "FTC_GLOBAL_DEBOUNCE_MS", default_value = "500")]
    pub global_debounce_ms: u64,

    /// Per-step debounce window for pattern-mode touches, in milliseconds.
    #[arg(long, env = "FTC_STEP_DEBOUNCE_MS", default_value = "1000")]
    pub step_debounce_ms: u64,

    /// Pause, in milliseconds, between each step of a pattern display animation.
    #[arg(long, env = "FTC_PATTERN_STEP_PAUSE_MS", default_value = "5000")]
    pub pattern_step_pause_ms: u64,

    /// Pause, in milliseconds, after a successful pattern submission's chase.
    #[arg(long, env = "FTC_PATTERN_SUCCESS_PAUSE_MS", default_value = "3500")]
    pub pattern_success_pause_ms: u64,

    /// Pause, in milliseconds, after an incorrect pattern step's error chase.
    #[arg(long, env = "FTC_PATTERN_ERROR_PAUSE_MS", default_value = "4000")]
    pub pattern_error_pause_ms: u64,

    /// Stagger, in milliseconds, between per-device chase commands.
    #[arg(long, env = "FTC_PATTERN_STAGGER_MS", default_value = "300")]
    pub pattern_stagger_ms: u64,

    /// Pause, in milliseconds, between athletes in pattern mode.
    #[arg(long, env = "FTC_PATTERN_ADVANCE_PAUSE_MS", default_value = "2000")]
    pub pattern_advance_pause_ms: u64,

    /// Log format (json or text).
    #[arg(long, env = "FTC_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FTC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_port == self.facade_port {
            anyhow::bail!("--heartbeat-port and --facade-port must differ");
        }
        if self.mesh_ssid.is_empty() {
            anyhow::bail!("--mesh-ssid must not be empty");
        }
        if self.db_path.as_os_str().is_empty() {
            anyhow::bail!("--db-path must not be empty");
        }
        if self.max_concurrent_runs == 0 {
            anyhow::bail!("--max-concurrent-runs must be at least 1");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
