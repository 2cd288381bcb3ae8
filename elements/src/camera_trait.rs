// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::CanonicalError;
use image::RgbImage;

use crate::types::CaptureSettings;

#[derive(Clone, Debug)]
pub struct CapturedFrame {
    // 8-bit-per-channel RGB raster at the requested resolution.
    pub image: RgbImage,

    pub timestamp: SystemTime,

    // Wall time spent inside capture(), including any driver latency.
    pub capture_latency: Duration,
}

// Errors returned by capture():
//   Unavailable: unrecoverable driver error (the CAPTURE_FAILED taxonomy
//     entry). The caller counts consecutive occurrences for escalation.
//   FailedPrecondition: camera closed, or the backend cannot produce the
//     requested resolution.
#[async_trait]
pub trait CameraTrait: Send {
    // Blocking from the caller's perspective; the settings are re-applied on
    // every call so per-program exposure and focus take effect without a
    // separate configuration step. The engine owns the only camera handle;
    // two tasks must never issue concurrent captures.
    async fn capture(&mut self, settings: &CaptureSettings)
                     -> Result<CapturedFrame, CanonicalError>;

    // No-op on backends without controllable illumination.
    fn set_lighting(&mut self, _level: f64) -> Result<(), CanonicalError> {
        Ok(())
    }

    // Releases the device. Subsequent capture() calls fail.
    fn close(&mut self);
}
