// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Color-presence tool. The master ROI yields per-channel HSV medians; the
// mask counts pixels inside tolerance bounds around those medians, with hue
// wrapping on the 0..180 half-circle scale.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::RgbImage;

use argus_elements::image_utils::{HsvImage, roi_crop, to_hsv};
use argus_elements::types::{DEFAULT_HUE_TOLERANCE,
                            DEFAULT_SATURATION_TOLERANCE,
                            DEFAULT_VALUE_TOLERANCE, Roi, ToolAux, ToolConfig};

use crate::tool::{ToolEvaluation, status_for_rate};

#[derive(Clone, Copy, Debug)]
pub struct ColorAreaFeatures {
    // Inclusive hue bounds on the 0..180 scale; lower > upper means the
    // window wraps through zero.
    pub hue_low: u8,
    pub hue_high: u8,

    pub saturation_low: u8,
    pub saturation_high: u8,
    pub value_low: u8,
    pub value_high: u8,

    pub master_count: u64,
}

fn channel_median(hsv: &HsvImage, channel: usize) -> u8 {
    let mut values: Vec<u8> = hsv.pixels().map(|p| p.0[channel]).collect();
    values.sort_unstable();
    values[values.len() / 2]
}

fn hue_in_window(hue: u8, low: u8, high: u8) -> bool {
    if low <= high {
        (low..=high).contains(&hue)
    } else {
        hue >= low || hue <= high
    }
}

fn masked_count(hsv: &HsvImage, features: &ColorAreaFeatures) -> u64 {
    hsv.pixels()
        .filter(|p| {
            let [h, s, v] = p.0;
            hue_in_window(h, features.hue_low, features.hue_high)
                && (features.saturation_low..=features.saturation_high)
                    .contains(&s)
                && (features.value_low..=features.value_high).contains(&v)
        })
        .count() as u64
}

pub fn extract(config: &ToolConfig, master: &RgbImage)
               -> Result<ColorAreaFeatures, CanonicalError> {
    let hsv = to_hsv(&roi_crop(master, &config.roi));
    if hsv.width() == 0 || hsv.height() == 0 {
        return Err(failed_precondition_error(&format!(
            "tool {}: empty master ROI", config.id)));
    }
    let hue_median = channel_median(&hsv, 0);
    let saturation_median = channel_median(&hsv, 1);
    let value_median = channel_median(&hsv, 2);

    let hue_tolerance = config.params.hue_tolerance
        .unwrap_or(DEFAULT_HUE_TOLERANCE).round() as i32;
    let saturation_tolerance = config.params.saturation_tolerance
        .unwrap_or(DEFAULT_SATURATION_TOLERANCE).round() as i32;
    let value_tolerance = config.params.value_tolerance
        .unwrap_or(DEFAULT_VALUE_TOLERANCE).round() as i32;

    let mut features = ColorAreaFeatures {
        hue_low: (hue_median as i32 - hue_tolerance).rem_euclid(180) as u8,
        hue_high: (hue_median as i32 + hue_tolerance).rem_euclid(180) as u8,
        saturation_low:
            (saturation_median as i32 - saturation_tolerance).clamp(0, 255) as u8,
        saturation_high:
            (saturation_median as i32 + saturation_tolerance).clamp(0, 255) as u8,
        value_low: (value_median as i32 - value_tolerance).clamp(0, 255) as u8,
        value_high: (value_median as i32 + value_tolerance).clamp(0, 255) as u8,
        master_count: 0,
    };
    features.master_count = masked_count(&hsv, &features);
    if features.master_count == 0 {
        return Err(failed_precondition_error(&format!(
            "tool {}: no master pixels inside the color window", config.id)));
    }
    Ok(features)
}

pub fn evaluate(config: &ToolConfig, features: &ColorAreaFeatures,
                image: &RgbImage, roi: &Roi) -> ToolEvaluation {
    let hsv = to_hsv(&roi_crop(image, roi));
    let test_count = masked_count(&hsv, features);
    let rate = (100.0 * test_count as f64 / features.master_count as f64)
        .min(200.0);
    ToolEvaluation {
        rate,
        status: status_for_rate(rate, config.threshold, config.upper_limit),
        aux: ToolAux {
            master_count: Some(features.master_count),
            test_count: Some(test_count),
            ..Default::default()
        },
    }
}

// mod tests.
