// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use image::RgbImage;

use argus_elements::types::{Roi, ToolAux, ToolConfig, ToolKind, ToolResult,
                            ToolStatus};

use crate::area_tool::{self, AreaFeatures};
use crate::color_area_tool::{self, ColorAreaFeatures};
use crate::edge_tool::{self, EdgeFeatures};
use crate::outline_tool::{self, OutlineFeatures};
use crate::position_tool::{self, PositionFeatures};

// Master features, extracted once at arm time from (master image, ROI).
// A tool whose extraction failed is carried as "unarmed" by the engine and
// reports ERROR on every cycle rather than NG with a zero rate.
#[derive(Clone, Debug)]
pub enum ToolFeatures {
    Outline(OutlineFeatures),
    Area(AreaFeatures),
    ColorArea(ColorAreaFeatures),
    EdgeDetection(EdgeFeatures),
    PositionAdjust(PositionFeatures),
}

#[derive(Clone, Debug)]
pub struct ToolEvaluation {
    // Matching rate in [0, 200]; 100 means "matches master".
    pub rate: f64,

    pub status: ToolStatus,
    pub aux: ToolAux,
}

// The uniform OK window: OK iff threshold <= rate <= (upper_limit or +inf).
pub fn status_for_rate(rate: f64, threshold: f64, upper_limit: Option<f64>)
                       -> ToolStatus {
    let upper = upper_limit.unwrap_or(f64::INFINITY);
    if rate >= threshold && rate <= upper {
        ToolStatus::Ok
    } else {
        ToolStatus::Ng
    }
}

pub fn error_evaluation(message: &str) -> ToolEvaluation {
    ToolEvaluation {
        rate: 0.0,
        status: ToolStatus::Error,
        aux: ToolAux { message: Some(message.to_string()), ..Default::default() },
    }
}

// Extraction errors leave the tool unarmed:
//   InvalidArgument: ROI outside the master image.
//   FailedPrecondition: degenerate master features (no contour, zero
//     matching pixel count).
pub fn extract_master_features(config: &ToolConfig, master: &RgbImage)
                               -> Result<ToolFeatures, CanonicalError> {
    if !config.roi.fits_within(master.width(), master.height()) {
        return Err(invalid_argument_error(&format!(
            "tool {} ROI ({},{} {}x{}) outside master image {}x{}",
            config.id, config.roi.x, config.roi.y, config.roi.w, config.roi.h,
            master.width(), master.height())));
    }
    match config.kind {
        ToolKind::Outline =>
            Ok(ToolFeatures::Outline(outline_tool::extract(config, master)?)),
        ToolKind::Area =>
            Ok(ToolFeatures::Area(area_tool::extract(config, master)?)),
        ToolKind::ColorArea =>
            Ok(ToolFeatures::ColorArea(
                color_area_tool::extract(config, master)?)),
        ToolKind::EdgeDetection =>
            Ok(ToolFeatures::EdgeDetection(edge_tool::extract(config, master)?)),
        ToolKind::PositionAdjust =>
            Ok(ToolFeatures::PositionAdjust(
                position_tool::extract(config, master)?)),
    }
}

// Evaluates a detection tool against `roi_adjusted` (the configured ROI plus
// the cycle's position offset). The position_adjust tool has its own
// evaluation path in position_tool; it is not dispatched here.
pub fn evaluate(config: &ToolConfig, features: &ToolFeatures,
                image: &RgbImage, roi_adjusted: &Roi) -> ToolEvaluation {
    if !roi_adjusted.fits_within(image.width(), image.height()) {
        return error_evaluation("ROI outside image after position offset");
    }
    match (config.kind, features) {
        (ToolKind::Outline, ToolFeatures::Outline(f)) =>
            outline_tool::evaluate(config, f, image, roi_adjusted),
        (ToolKind::Area, ToolFeatures::Area(f)) =>
            area_tool::evaluate(config, f, image, roi_adjusted),
        (ToolKind::ColorArea, ToolFeatures::ColorArea(f)) =>
            color_area_tool::evaluate(config, f, image, roi_adjusted),
        (ToolKind::EdgeDetection, ToolFeatures::EdgeDetection(f)) =>
            edge_tool::evaluate(config, f, image, roi_adjusted),
        _ => error_evaluation("master features do not match tool kind"),
    }
}

pub fn tool_result(config: &ToolConfig, evaluation: ToolEvaluation)
                   -> ToolResult {
    ToolResult {
        tool_id: config.id,
        kind: config.kind,
        status: evaluation.status,
        rate: evaluation.rate,
        threshold: config.threshold,
        upper_limit: config.upper_limit,
        aux: evaluation.aux,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_window() {
        assert_eq!(status_for_rate(100.0, 90.0, None), ToolStatus::Ok);
        assert_eq!(status_for_rate(89.9, 90.0, None), ToolStatus::Ng);
        assert_eq!(status_for_rate(150.0, 90.0, Some(110.0)), ToolStatus::Ng);
        assert_eq!(status_for_rate(110.0, 90.0, Some(110.0)), ToolStatus::Ok);
        // Threshold zero with no upper limit is always OK.
        assert_eq!(status_for_rate(0.0, 0.0, None), ToolStatus::Ok);
    }
}  // mod tests.
