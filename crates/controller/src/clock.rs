// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wall-clock and monotonic time, behind a trait so tests can substitute a
//! deterministic fake for the timing-sensitive parts of the session engine
//! and pattern generator.

use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of wall-clock and monotonic time, and of random identifiers.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// A monotonic instant, for measuring elapsed durations immune to clock
    /// adjustments.
    fn monotonic_now(&self) -> Instant;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Render a UTC timestamp the way the wire protocol and the store expect:
/// ISO-8601 with millisecond precision.
pub fn format_iso8601(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Controller wall time expressed as milliseconds since the Unix epoch, for
/// the `master_time` field of heartbeat acknowledgements.
pub fn epoch_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Generate a new random identifier, rendered as a string.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
