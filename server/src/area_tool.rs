// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Bright-area ratio tool. The master ROI fixes a binarization threshold
// (Otsu by default, operator override when provided) and a reference pixel
// count; evaluation applies the identical threshold to the test ROI. This is
// the most light-sensitive tool; the first-cycle consistency check exists
// largely for its benefit.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::{GrayImage, RgbImage};
use imageproc::contrast::otsu_level;

use argus_elements::image_utils::{roi_crop, to_gray};
use argus_elements::types::{Roi, ToolAux, ToolConfig};

use crate::tool::{ToolEvaluation, status_for_rate};

#[derive(Clone, Copy, Debug)]
pub struct AreaFeatures {
    // Binarization threshold applied to both master and test ROIs.
    pub threshold: u8,

    pub master_count: u64,
}

fn count_at_or_above(gray: &GrayImage, threshold: u8) -> u64 {
    gray.pixels().filter(|p| p.0[0] >= threshold).count() as u64
}

pub fn extract(config: &ToolConfig, master: &RgbImage)
               -> Result<AreaFeatures, CanonicalError> {
    let gray = to_gray(&roi_crop(master, &config.roi));
    let threshold = match config.params.threshold_override {
        Some(value) => value,
        None => otsu_level(&gray),
    };
    let master_count = count_at_or_above(&gray, threshold);
    if master_count == 0 {
        return Err(failed_precondition_error(&format!(
            "tool {}: no master pixels at or above threshold {}",
            config.id, threshold)));
    }
    Ok(AreaFeatures { threshold, master_count })
}

pub fn evaluate(config: &ToolConfig, features: &AreaFeatures,
                image: &RgbImage, roi: &Roi) -> ToolEvaluation {
    let gray = to_gray(&roi_crop(image, roi));
    let test_count = count_at_or_above(&gray, features.threshold);
    let rate = (100.0 * test_count as f64 / features.master_count as f64)
        .min(200.0);
    ToolEvaluation {
        rate,
        status: status_for_rate(rate, config.threshold, config.upper_limit),
        aux: ToolAux {
            threshold_used: Some(features.threshold),
            master_count: Some(features.master_count),
            test_count: Some(test_count),
            ..Default::default()
        },
    }
}

// mod tests.
