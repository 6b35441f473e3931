// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pattern Generator (§4.G.5): random touch sequences for Pattern-mode
//! ("Simon Says") drills.
//!
//! The RNG is injected so tests get deterministic sequences from a seeded
//! generator (§8 property 8) rather than reaching for real entropy.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// One colored cone eligible for pattern generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColoredDevice {
    pub device_id: String,
    pub device_name: String,
    pub color: String,
}

/// A generated pattern: the ordered devices, plus derived views used by the
/// display sequence and submission checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub devices: Vec<ColoredDevice>,
}

impl Pattern {
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.device_id.clone()).collect()
    }

    /// Human-readable description: colors uppercased, joined by " → ".
    pub fn description(&self) -> String {
        self.devices.iter().map(|d| d.color.to_uppercase()).collect::<Vec<_>>().join(" → ")
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Same device sequence as `other`, device-for-device.
    pub fn repeats(&self, other: &[ColoredDevice]) -> bool {
        patterns_match(&self.devices, other)
    }
}

/// Clamp `sequence_length` into `[3, 8]` per the boundary behavior in §8.
fn clamp_length(sequence_length: usize) -> usize {
    sequence_length.clamp(3, 8)
}

fn sample_with_no_consecutive_repeat<R: Rng + ?Sized>(
    colored_devices: &[ColoredDevice],
    sequence_length: usize,
    rng: &mut R,
) -> Vec<ColoredDevice> {
    let mut pattern: Vec<ColoredDevice> = Vec::with_capacity(sequence_length);
    for _ in 0..sequence_length {
        let available: Vec<&ColoredDevice> = match pattern.last() {
            Some(prev) => {
                let filtered: Vec<&ColoredDevice> =
                    colored_devices.iter().filter(|d| d.device_id != prev.device_id).collect();
                if filtered.is_empty() {
                    colored_devices.iter().collect()
                } else {
                    filtered
                }
            }
            None => colored_devices.iter().collect(),
        };
        let idx = rng.random_range(0..available.len());
        pattern.push(available[idx].clone());
    }
    pattern
}

fn sample_without_replacement<R: Rng + ?Sized>(
    colored_devices: &[ColoredDevice],
    max_length: usize,
    rng: &mut R,
) -> Vec<ColoredDevice> {
    let mut pool: Vec<ColoredDevice> = colored_devices.to_vec();
    let mut pattern = Vec::with_capacity(max_length);
    for _ in 0..max_length {
        let idx = rng.random_range(0..pool.len());
        pattern.push(pool.remove(idx));
    }
    pattern
}

fn patterns_match(a: &[ColoredDevice], b: &[ColoredDevice]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.device_id == y.device_id)
}

/// Generate a pattern. `last_pattern` is the immediately previous pattern
/// produced for this session (if any); regeneration is attempted up to 10
/// times to avoid an exact repeat.
///
/// `allow_repeats` is forced to `true` when `sequence_length` (after
/// clamping) exceeds the number of colored devices, per §8's boundary
/// behavior, and the caller is expected to log that override.
pub fn generate(
    colored_devices: &[ColoredDevice],
    sequence_length: usize,
    allow_repeats: bool,
    last_pattern: Option<&[ColoredDevice]>,
    rng: &mut impl Rng,
) -> Result<(Pattern, bool), crate::error::AppError> {
    if colored_devices.is_empty() {
        return Err(crate::error::AppError::Constraint("no colored devices available for pattern generation".into()));
    }

    let sequence_length = clamp_length(sequence_length);
    let forced_repeats = !allow_repeats && sequence_length > colored_devices.len();
    let effective_allow_repeats = allow_repeats || forced_repeats;
    let max_length = sequence_length.min(colored_devices.len().max(sequence_length));

    let mut pattern = if effective_allow_repeats {
        sample_with_no_consecutive_repeat(colored_devices, sequence_length, rng)
    } else {
        sample_without_replacement(colored_devices, sequence_length.min(colored_devices.len()), rng)
    };
    let _ = max_length;

    if let Some(last) = last_pattern {
        let mut attempts = 0;
        while patterns_match(&pattern, last) && attempts < 10 {
            pattern = if effective_allow_repeats {
                sample_with_no_consecutive_repeat(colored_devices, sequence_length, rng)
            } else {
                sample_without_replacement(colored_devices, sequence_length.min(colored_devices.len()), rng)
            };
            attempts += 1;
        }
    }

    Ok((Pattern { devices: pattern }, forced_repeats))
}
