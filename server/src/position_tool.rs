// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Part-displacement compensation. The master ROI becomes a grayscale
// template; each cycle the template is located in a bounded search region by
// normalized cross-correlation and the resulting offset is applied to every
// other tool's ROI for the remainder of the cycle.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::{GrayImage, RgbImage};

use argus_elements::image_utils::{roi_crop, to_gray};
use argus_elements::types::{DEFAULT_SEARCH_MARGIN, Roi, ToolAux, ToolConfig,
                            ToolStatus};

use crate::tool::status_for_rate;

#[derive(Clone, Debug)]
pub struct PositionFeatures {
    template: GrayImage,

    // Center of the template ROI in master coordinates; the reference the
    // published offset is measured from.
    expected_center: (f64, f64),

    search_margin: u32,
}

// Unlike the detection tools, the position tool reports the offset it found
// alongside the usual rate/status pair.
#[derive(Clone, Debug)]
pub struct PositionEvaluation {
    pub rate: f64,
    pub status: ToolStatus,

    // (dx, dy) to add to every detection ROI this cycle. (0, 0) when the
    // match fell below the tool's threshold.
    pub offset: (i32, i32),

    pub aux: ToolAux,
}

pub fn extract(config: &ToolConfig, master: &RgbImage)
               -> Result<PositionFeatures, CanonicalError> {
    let template = to_gray(&roi_crop(master, &config.roi));
    if template.width() == 0 || template.height() == 0 {
        return Err(failed_precondition_error(&format!(
            "tool {}: empty template ROI", config.id)));
    }
    Ok(PositionFeatures {
        template,
        expected_center: config.roi.center(),
        search_margin: config.params.search_margin
            .unwrap_or(DEFAULT_SEARCH_MARGIN),
    })
}

fn error_evaluation(message: &str) -> PositionEvaluation {
    PositionEvaluation {
        rate: 0.0,
        status: ToolStatus::Error,
        offset: (0, 0),
        aux: ToolAux {
            offset: Some((0, 0)),
            message: Some(message.to_string()),
            ..Default::default()
        },
    }
}

// Zero-mean normalized cross-correlation search: Pearson correlation of the
// template against every full-overlap placement in `region`, so uniform
// regions score zero rather than high (plain NCC of non-negative images
// rewards flat patches). Returns the best score clamped to [0, 1] and its
// placement, or None for a featureless template.
fn best_match(region: &GrayImage, template: &GrayImage)
              -> Option<(f64, (u32, u32))> {
    let (tw, th) = template.dimensions();
    let n = (tw * th) as f64;

    let template_sum: f64 =
        template.pixels().map(|p| p.0[0] as f64).sum();
    let template_mean = template_sum / n;
    let mut template_centered = Vec::with_capacity((tw * th) as usize);
    let mut template_norm_squared = 0.0_f64;
    for pixel in template.pixels() {
        let centered = pixel.0[0] as f64 - template_mean;
        template_centered.push(centered);
        template_norm_squared += centered * centered;
    }
    if template_norm_squared == 0.0 {
        return None;
    }
    let template_norm = template_norm_squared.sqrt();

    let mut best_score = f64::NEG_INFINITY;
    let mut best_location = (0_u32, 0_u32);
    for y0 in 0..=(region.height() - th) {
        for x0 in 0..=(region.width() - tw) {
            let mut region_sum = 0.0_f64;
            let mut region_square_sum = 0.0_f64;
            let mut product_sum = 0.0_f64;
            let mut index = 0;
            for y in 0..th {
                for x in 0..tw {
                    let value = region.get_pixel(x0 + x, y0 + y).0[0] as f64;
                    region_sum += value;
                    region_square_sum += value * value;
                    product_sum += template_centered[index] * value;
                    index += 1;
                }
            }
            let region_mean = region_sum / n;
            let region_norm_squared =
                region_square_sum - n * region_mean * region_mean;
            // product_sum already equals the centered cross term because the
            // template terms sum to zero.
            let score = if region_norm_squared <= 0.0 {
                0.0
            } else {
                product_sum / (template_norm * region_norm_squared.sqrt())
            };
            if score > best_score {
                best_score = score;
                best_location = (x0, y0);
            }
        }
    }
    Some((best_score.clamp(0.0, 1.0), best_location))
}

pub fn evaluate(config: &ToolConfig, features: &PositionFeatures,
                image: &RgbImage) -> PositionEvaluation {
    let margin = features.search_margin as i32;
    let (center_x, center_y) = features.expected_center;
    let half_w = config.roi.w as i32 / 2 + margin;
    let half_h = config.roi.h as i32 / 2 + margin;
    let search = Roi::new((center_x as i32) - half_w,
                          (center_y as i32) - half_h,
                          (2 * half_w) as u32, (2 * half_h) as u32);

    let gray = to_gray(image);
    // roi_crop clamps to the image; note where the clamped region actually
    // starts so match locations can be mapped back to image coordinates.
    let region_x = search.x.max(0);
    let region_y = search.y.max(0);
    let region = roi_crop(&gray, &search);

    // When the template ROI is so large that the search region cannot give
    // it slide room (e.g. a full-frame template), shrink the template
    // symmetrically by the margin so a +/-margin displacement is still
    // findable. The center is unchanged by a symmetric crop.
    let cropped_template;
    let mut template = &features.template;
    if region.width() <= template.width() || region.height() <= template.height() {
        let new_w = template.width() as i32 - 2 * margin;
        let new_h = template.height() as i32 - 2 * margin;
        if new_w < 8 || new_h < 8 {
            return error_evaluation("search region smaller than template");
        }
        cropped_template = roi_crop(
            template, &Roi::new(margin, margin, new_w as u32, new_h as u32));
        template = &cropped_template;
        if region.width() < template.width()
            || region.height() < template.height() {
            return error_evaluation("search region smaller than template");
        }
    }

    let (score, (match_x, match_y)) = match best_match(&region, template) {
        Some(found) => found,
        None => return error_evaluation("degenerate (flat) template"),
    };

    let matched_center_x =
        region_x as f64 + match_x as f64 + template.width() as f64 / 2.0;
    let matched_center_y =
        region_y as f64 + match_y as f64 + template.height() as f64 / 2.0;

    let rate = 100.0 * score;
    if rate < config.threshold {
        let mut evaluation = error_evaluation("match below threshold");
        evaluation.rate = rate;
        evaluation.aux.match_score = Some(score);
        return evaluation;
    }

    let offset = ((matched_center_x - center_x).round() as i32,
                  (matched_center_y - center_y).round() as i32);
    PositionEvaluation {
        rate,
        status: status_for_rate(rate, config.threshold, config.upper_limit),
        offset,
        aux: ToolAux {
            offset: Some(offset),
            match_score: Some(score),
            ..Default::default()
        },
    }
}

// mod tests.
