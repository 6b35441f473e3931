// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local output drivers (component E adjunct): the virtual controller-local
//! cone ("Device 0") short-circuits LED and audio commands to locally driven
//! hardware when present, per §9's "optional hardware" design note. Each
//! driver sits behind a trait seam with a no-op implementation used when no
//! hardware is configured.

use tracing::debug;

use crate::command::LedPattern;

/// Local LED strip driver, or a no-op when no hardware is attached.
pub trait LocalLed: Send + Sync {
    fn set(&self, pattern: LedPattern);
}

/// Local audio output driver, or a no-op when no hardware is attached.
pub trait LocalAudio: Send + Sync {
    fn play(&self, clip: &str);
}

/// Default implementation used when the controller has no attached LED
/// strip; it only ever logs what would have been driven.
pub struct NoopLed;

impl LocalLed for NoopLed {
    fn set(&self, pattern: LedPattern) {
        debug!(?pattern, "local LED driver not present, pattern recorded only");
    }
}

/// Default implementation used when the controller has no attached audio
/// output.
pub struct NoopAudio;

impl LocalAudio for NoopAudio {
    fn play(&self, clip: &str) {
        debug!(%clip, "local audio driver not present, clip recorded only");
    }
}
