// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Deterministic camera backend serving a fixed raster, for development
// benches and tests. Capture latency and transient failures are injectable
// so trigger-drop and camera-escalation behavior can be exercised without
// hardware.

use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      unavailable_error};
use image::RgbImage;

use argus_elements::camera_trait::{CameraTrait, CapturedFrame};
use argus_elements::types::CaptureSettings;

pub struct ImageCamera {
    image: RgbImage,
    latency: Duration,
    fail_next: u32,
    closed: bool,
}

impl ImageCamera {
    pub fn new(image: RgbImage) -> Self {
        ImageCamera {
            image,
            latency: Duration::ZERO,
            fail_next: 0,
            closed: false,
        }
    }

    // Replaces the frame served by subsequent captures.
    pub fn set_image(&mut self, image: RgbImage) {
        self.image = image;
    }

    // Artificial per-capture latency, simulating exposure plus readout.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    // The next `count` captures fail with Unavailable.
    pub fn fail_next_captures(&mut self, count: u32) {
        self.fail_next = count;
    }
}

#[async_trait]
impl CameraTrait for ImageCamera {
    async fn capture(&mut self, settings: &CaptureSettings)
                     -> Result<CapturedFrame, CanonicalError> {
        if self.closed {
            return Err(failed_precondition_error("camera is closed"));
        }
        let start = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(unavailable_error("injected capture failure"));
        }
        if self.image.dimensions() != settings.resolution {
            return Err(failed_precondition_error(&format!(
                "camera image is {}x{}, requested {}x{}",
                self.image.width(), self.image.height(),
                settings.resolution.0, settings.resolution.1)));
        }
        Ok(CapturedFrame {
            image: self.image.clone(),
            timestamp: SystemTime::now(),
            capture_latency: start.elapsed(),
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// mod tests.
