// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Edge-density tool. The master ROI fixes the Canny thresholds and a
// reference edge-pixel count; evaluation reruns the identical pipeline on
// the test ROI and scores the count ratio.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::{GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;

use argus_elements::image_utils::{roi_crop, to_gray};
use argus_elements::types::{DEFAULT_CANNY_HIGH, DEFAULT_CANNY_LOW, Roi,
                            ToolAux, ToolConfig};

use crate::tool::{ToolEvaluation, status_for_rate};

const BLUR_SIGMA: f32 = 1.0;

#[derive(Clone, Copy, Debug)]
pub struct EdgeFeatures {
    // Canny thresholds frozen at arm time.
    pub low: f32,
    pub high: f32,

    pub master_edges: u64,
}

fn edge_count(image: &RgbImage, roi: &Roi, low: f32, high: f32) -> u64 {
    let gray: GrayImage = to_gray(&roi_crop(image, roi));
    let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
    let edges = canny(&blurred, low, high);
    edges.pixels().filter(|p| p.0[0] != 0).count() as u64
}

pub fn extract(config: &ToolConfig, master: &RgbImage)
               -> Result<EdgeFeatures, CanonicalError> {
    let low = config.params.canny_low.unwrap_or(DEFAULT_CANNY_LOW);
    let high = config.params.canny_high.unwrap_or(DEFAULT_CANNY_HIGH);
    let master_edges = edge_count(master, &config.roi, low, high);
    if master_edges == 0 {
        return Err(failed_precondition_error(&format!(
            "tool {}: no edges found in master ROI", config.id)));
    }
    Ok(EdgeFeatures { low, high, master_edges })
}

pub fn evaluate(config: &ToolConfig, features: &EdgeFeatures,
                image: &RgbImage, roi: &Roi) -> ToolEvaluation {
    let test_edges = edge_count(image, roi, features.low, features.high);
    let rate = (100.0 * test_edges as f64 / features.master_edges as f64)
        .min(200.0);
    ToolEvaluation {
        rate,
        status: status_for_rate(rate, config.threshold, config.upper_limit),
        aux: ToolAux {
            master_count: Some(features.master_edges),
            test_count: Some(test_edges),
            ..Default::default()
        },
    }
}

// mod tests.
