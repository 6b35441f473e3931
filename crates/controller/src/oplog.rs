// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator log (component K / §6.3): a bounded in-memory ring buffer of
//! coach-facing log lines, exposed read-only through the query facade.
//!
//! Structurally this is the same fixed-capacity, overwrite-oldest shape as
//! a byte ring buffer, adapted to hold discrete entries in a `VecDeque`
//! rather than raw bytes, since callers want whole log lines, not byte
//! ranges.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One operator-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

/// Fixed-capacity operator log. When full, pushing a new entry discards the
/// oldest.
pub struct OperatorLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl OperatorLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Append a log entry, evicting the oldest if at capacity.
    pub async fn push(&self, level: &str, source: &str, node_id: Option<&str>, message: &str) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.to_owned(),
            source: source.to_owned(),
            node_id: node_id.map(str::to_owned),
            message: message.to_owned(),
        });
    }

    /// Return up to `limit` most recent entries, newest last.
    pub async fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
