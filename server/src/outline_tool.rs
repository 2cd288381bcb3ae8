// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Shape presence/identity tool. The master ROI is reduced to its largest
// outer contour; evaluation blends contour-shape similarity (Hu moments),
// edge-template correlation, and contour-area ratio into one matching rate.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::{GrayImage, RgbImage};
use imageproc::contours::{BorderType, find_contours};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::point::Point;

use argus_elements::image_utils::{roi_crop, to_gray};
use argus_elements::types::{DEFAULT_CANNY_HIGH, DEFAULT_CANNY_LOW, Roi,
                            ToolAux, ToolConfig};

use crate::tool::{ToolEvaluation, status_for_rate};

// Approximates the 5x5 Gaussian used when the masters were registered.
const BLUR_SIGMA: f32 = 1.0;

#[derive(Clone, Debug)]
pub struct OutlineFeatures {
    // Hu invariants of the largest outer contour of the master ROI.
    hu: [f64; 7],

    // Shoelace area of that contour.
    area: f64,

    // Raw Canny edge map of the master ROI, kept as a template.
    edge_map: GrayImage,
}

fn canny_thresholds(config: &ToolConfig) -> (f32, f32) {
    (config.params.canny_low.unwrap_or(DEFAULT_CANNY_LOW),
     config.params.canny_high.unwrap_or(DEFAULT_CANNY_HIGH))
}

fn edge_pipeline(image: &RgbImage, roi: &Roi, low: f32, high: f32)
                 -> GrayImage {
    let gray = to_gray(&roi_crop(image, roi));
    let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
    canny(&blurred, low, high)
}

// Shoelace area of a closed contour.
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut doubled = 0.0_f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        doubled += a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
    }
    doubled.abs() / 2.0
}

fn largest_outer_contour(edges: &GrayImage) -> Option<(Vec<Point<i32>>, f64)> {
    find_contours::<i32>(edges)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| {
            let area = contour_area(&c.points);
            (c.points, area)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

// Hu's seven moment invariants over the contour treated as a point set.
fn hu_moments(points: &[Point<i32>]) -> [f64; 7] {
    let n = points.len() as f64;
    let mut mean_x = 0.0_f64;
    let mut mean_y = 0.0_f64;
    for p in points {
        mean_x += p.x as f64;
        mean_y += p.y as f64;
    }
    mean_x /= n;
    mean_y /= n;

    // Central moments through third order.
    let mut mu = [[0.0_f64; 4]; 4];
    for point in points {
        let dx = point.x as f64 - mean_x;
        let dy = point.y as f64 - mean_y;
        let dx2 = dx * dx;
        let dy2 = dy * dy;
        mu[2][0] += dx2;
        mu[0][2] += dy2;
        mu[1][1] += dx * dy;
        mu[3][0] += dx2 * dx;
        mu[0][3] += dy2 * dy;
        mu[2][1] += dx2 * dy;
        mu[1][2] += dx * dy2;
    }

    // Scale-normalized moments; mu00 is the point count.
    let eta = |p: usize, q: usize| -> f64 {
        mu[p][q] / n.powf(1.0 + (p + q) as f64 / 2.0)
    };
    let n20 = eta(2, 0);
    let n02 = eta(0, 2);
    let n11 = eta(1, 1);
    let n30 = eta(3, 0);
    let n03 = eta(0, 3);
    let n21 = eta(2, 1);
    let n12 = eta(1, 2);

    let q30 = n30 + n12;
    let q03 = n21 + n03;
    [
        n20 + n02,
        (n20 - n02).powi(2) + 4.0 * n11 * n11,
        (n30 - 3.0 * n12).powi(2) + (3.0 * n21 - n03).powi(2),
        q30 * q30 + q03 * q03,
        (n30 - 3.0 * n12) * q30 * (q30 * q30 - 3.0 * q03 * q03)
            + (3.0 * n21 - n03) * q03 * (3.0 * q30 * q30 - q03 * q03),
        (n20 - n02) * (q30 * q30 - q03 * q03) + 4.0 * n11 * q30 * q03,
        (3.0 * n21 - n03) * q30 * (q30 * q30 - 3.0 * q03 * q03)
            - (n30 - 3.0 * n12) * q03 * (3.0 * q30 * q30 - q03 * q03),
    ]
}

// The I1 metric: sum of |1/mA - 1/mB| over log-scaled Hu terms. Terms too
// close to zero on either side are skipped.
fn match_shapes_i1(a: &[f64; 7], b: &[f64; 7]) -> f64 {
    let mut sum = 0.0_f64;
    for i in 0..7 {
        if a[i].abs() < 1e-30 || b[i].abs() < 1e-30 {
            continue;
        }
        let ma = a[i].signum() * a[i].abs().log10();
        let mb = b[i].signum() * b[i].abs().log10();
        sum += (1.0 / ma - 1.0 / mb).abs();
    }
    sum
}

// Normalized cross-correlation of two equally sized edge maps.
fn edge_map_correlation(a: &GrayImage, b: &GrayImage) -> f64 {
    let mut product_sum = 0.0_f64;
    let mut a_square_sum = 0.0_f64;
    let mut b_square_sum = 0.0_f64;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let va = pa.0[0] as f64;
        let vb = pb.0[0] as f64;
        product_sum += va * vb;
        a_square_sum += va * va;
        b_square_sum += vb * vb;
    }
    let denominator = (a_square_sum * b_square_sum).sqrt();
    if denominator == 0.0 {
        // Both maps empty means they agree; one empty means no correlation.
        return if a_square_sum == 0.0 && b_square_sum == 0.0 { 1.0 } else { 0.0 };
    }
    product_sum / denominator
}

pub fn extract(config: &ToolConfig, master: &RgbImage)
               -> Result<OutlineFeatures, CanonicalError> {
    let (low, high) = canny_thresholds(config);
    let edges = edge_pipeline(master, &config.roi, low, high);
    let (points, area) = largest_outer_contour(&edges).ok_or_else(
        || failed_precondition_error(&format!(
            "tool {}: no contour found in master ROI", config.id)))?;
    if area <= 0.0 {
        return Err(failed_precondition_error(&format!(
            "tool {}: degenerate master contour (zero area)", config.id)));
    }
    Ok(OutlineFeatures { hu: hu_moments(&points), area, edge_map: edges })
}

pub fn evaluate(config: &ToolConfig, features: &OutlineFeatures,
                image: &RgbImage, roi: &Roi) -> ToolEvaluation {
    let (low, high) = canny_thresholds(config);
    let edges = edge_pipeline(image, roi, low, high);

    let template_score =
        (edge_map_correlation(&features.edge_map, &edges).clamp(0.0, 1.0))
        * 100.0;

    let (shape_score, area_score, rate) = match largest_outer_contour(&edges) {
        None => (0.0, 0.0, 0.0),
        Some((points, area)) => {
            let distance = match_shapes_i1(&features.hu, &hu_moments(&points));
            // exp(-ln10 * d): a perfect match scores 100, a match one I1
            // unit away scores 10.
            let shape = 100.0 * (-std::f64::consts::LN_10 * distance).exp();
            let larger = features.area.max(area);
            let area_ratio = if larger > 0.0 {
                100.0 * features.area.min(area) / larger
            } else {
                0.0
            };
            let rate = 0.5 * shape + 0.3 * template_score + 0.2 * area_ratio;
            (shape, area_ratio, rate)
        }
    };

    ToolEvaluation {
        rate,
        status: status_for_rate(rate, config.threshold, config.upper_limit),
        aux: ToolAux {
            shape_score: Some(shape_score),
            template_score: Some(template_score),
            area_score: Some(area_score),
            ..Default::default()
        },
    }
}

// mod tests.
