// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command Emitter (component E) — the frames the controller sends to a
//! cone, and the LED pattern enum from the wire protocol.

use serde::{Deserialize, Serialize};

use crate::broker::registry::CourseStatus;

/// The full LED pattern enum recognized by cones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedPattern {
    Off,
    SolidGreen,
    SolidBlue,
    SolidRed,
    SolidAmber,
    SolidYellow,
    SolidWhite,
    SolidPurple,
    SolidCyan,
    BlinkAmber,
    Rainbow,
    Chase,
    ChaseRed,
    ChaseGreen,
    ChaseBlue,
    ChaseAmber,
    ChaseYellow,
    FlashGreen,
    FlashRed,
}

impl LedPattern {
    /// The wire string for this pattern, matching the `snake_case` the wire
    /// protocol and `serde` both use. Used where the registry needs a plain
    /// `String` (its commanded-state fields) rather than a typed command.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::SolidGreen => "solid_green",
            Self::SolidBlue => "solid_blue",
            Self::SolidRed => "solid_red",
            Self::SolidAmber => "solid_amber",
            Self::SolidYellow => "solid_yellow",
            Self::SolidWhite => "solid_white",
            Self::SolidPurple => "solid_purple",
            Self::SolidCyan => "solid_cyan",
            Self::BlinkAmber => "blink_amber",
            Self::Rainbow => "rainbow",
            Self::Chase => "chase",
            Self::ChaseRed => "chase_red",
            Self::ChaseGreen => "chase_green",
            Self::ChaseBlue => "chase_blue",
            Self::ChaseAmber => "chase_amber",
            Self::ChaseYellow => "chase_yellow",
            Self::FlashGreen => "flash_green",
            Self::FlashRed => "flash_red",
        }
    }

    /// Client-side chase patterns self-terminate after 3.0s and revert to
    /// the previously latched solid color; the server relies on this rather
    /// than sending an explicit "stop chase."
    pub fn is_chase(&self) -> bool {
        matches!(
            self,
            Self::Chase | Self::ChaseRed | Self::ChaseGreen | Self::ChaseBlue | Self::ChaseAmber | Self::ChaseYellow
        )
    }

    /// Map an assigned color name (as carried in `behavior_config`) to its
    /// solid LED pattern.
    pub fn solid_for_color(color: &str) -> Option<Self> {
        match color.to_ascii_lowercase().as_str() {
            "green" => Some(Self::SolidGreen),
            "blue" => Some(Self::SolidBlue),
            "red" => Some(Self::SolidRed),
            "amber" => Some(Self::SolidAmber),
            "yellow" => Some(Self::SolidYellow),
            "white" => Some(Self::SolidWhite),
            "purple" => Some(Self::SolidPurple),
            "cyan" => Some(Self::SolidCyan),
            _ => None,
        }
    }

    /// Map an assigned color name to its chase variant, used for pattern
    /// display and success/error animations.
    pub fn chase_for_color(color: &str) -> Option<Self> {
        match color.to_ascii_lowercase().as_str() {
            "green" => Some(Self::ChaseGreen),
            "blue" => Some(Self::ChaseBlue),
            "red" => Some(Self::ChaseRed),
            "amber" => Some(Self::ChaseAmber),
            "yellow" => Some(Self::ChaseYellow),
            _ => None,
        }
    }
}

/// A single command frame sent controller-to-cone. Each variant corresponds
/// to one of the JSON shapes in the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Led { cmd: &'static str, pattern: LedPattern },
    Audio { cmd: &'static str, clip: String },
    Start { cmd: &'static str, course_status: CourseStatus },
    Stop { cmd: &'static str, action: Option<String>, course_status: Option<CourseStatus> },
    Deploy { deploy: bool, action: String, course: String },
    Calibrate { cmd: &'static str, action: &'static str, threshold: f64 },
}

impl Command {
    pub fn led(pattern: LedPattern) -> Self {
        Self::Led { cmd: "led", pattern }
    }

    pub fn audio(clip: impl Into<String>) -> Self {
        Self::Audio { cmd: "audio", clip: clip.into() }
    }

    pub fn start() -> Self {
        Self::Start { cmd: "start", course_status: CourseStatus::Active }
    }

    pub fn stop(course_status: Option<CourseStatus>) -> Self {
        Self::Stop { cmd: "stop", action: None, course_status }
    }

    pub fn deploy(action: impl Into<String>, course: impl Into<String>) -> Self {
        Self::Deploy { deploy: true, action: action.into(), course: course.into() }
    }

    pub fn calibrate(threshold: f64) -> Self {
        Self::Calibrate { cmd: "calibrate", action: "set_threshold", threshold }
    }
}
