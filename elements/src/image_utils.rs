// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use image::{GrayImage, ImageBuffer, ImageEncoder, Pixel, Rgb, RgbImage};
use image::codecs::png::PngEncoder;
use image::imageops;
use imageproc::filter::laplacian_filter;
use serde::{Deserialize, Serialize};

use crate::types::Roi;

// HSV raster in the OpenCV 8-bit convention: H in [0, 180), S and V in
// [0, 255]. Stored in an Rgb<u8> buffer as (h, s, v) triples.
pub type HsvImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

// BT.601 luma, matching the weights used when the master was registered.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut out = Vec::with_capacity((width * height) as usize);
    for pixel in image.pixels() {
        let [r, g, b] = pixel.0;
        let luma =
            0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        out.push(luma.round().min(255.0) as u8);
    }
    GrayImage::from_raw(width, height, out).unwrap()
}

pub fn to_hsv(image: &RgbImage) -> HsvImage {
    let (width, height) = image.dimensions();
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for pixel in image.pixels() {
        let [r, g, b] = pixel.0;
        let (h, s, v) = rgb_to_hsv(r, g, b);
        out.push(h);
        out.push(s);
        out.push(v);
    }
    HsvImage::from_raw(width, height, out).unwrap()
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let v = max;
    let delta = (max - min) as f64;
    let s = if max == 0 {
        0
    } else {
        (255.0 * delta / max as f64).round() as u8
    };
    if delta == 0.0 {
        return (0, s, v);
    }
    let rf = r as f64;
    let gf = g as f64;
    let bf = b as f64;
    let mut hue_degrees = if max == r {
        60.0 * (gf - bf) / delta
    } else if max == g {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if hue_degrees < 0.0 {
        hue_degrees += 360.0;
    }
    // Half-circle scale so hue fits in 8 bits.
    let h = (hue_degrees / 2.0).round() as u16 % 180;
    (h as u8, s, v)
}

// Crop `roi` out of `image`, clamping the rectangle to the image bounds. A
// ROI entirely outside the image yields an empty (0x0) buffer; callers that
// must not silently crop check Roi::fits_within() first.
pub fn roi_crop<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, roi: &Roi)
                   -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + 'static,
{
    let (width, height) = image.dimensions();
    let x0 = roi.x.clamp(0, width as i32) as u32;
    let y0 = roi.y.clamp(0, height as i32) as u32;
    let x1 = (roi.x as i64 + roi.w as i64).clamp(0, width as i64) as u32;
    let y1 = (roi.y as i64 + roi.h as i64).clamp(0, height as i64) as u32;
    if x1 <= x0 || y1 <= y0 {
        return ImageBuffer::new(0, 0);
    }
    imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
}

// Laplacian variance at which the sharpness sub-score saturates.
const SHARPNESS_FULL_SCALE: f64 = 150.0;

// Luma levels at or beyond which a pixel counts as clipped.
const CLIP_LOW: u8 = 2;
const CLIP_HIGH: u8 = 253;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QualityMetrics {
    // Mean luma, 0..255.
    pub brightness: f64,

    // Variance of the 3x3 Laplacian response.
    pub sharpness: f64,

    // 0..100; penalizes clipped (blown or crushed) pixels.
    pub exposure: f64,

    // 0..100 weighted sum: 30% brightness fit, 50% sharpness, 20% exposure.
    pub score: f64,
}

pub fn quality_metrics(image: &RgbImage) -> QualityMetrics {
    let gray = to_gray(image);
    let pixel_count = (gray.width() * gray.height()).max(1) as f64;

    let mut luma_sum = 0.0_f64;
    let mut clipped = 0_u64;
    for pixel in gray.pixels() {
        let value = pixel.0[0];
        luma_sum += value as f64;
        if value <= CLIP_LOW || value >= CLIP_HIGH {
            clipped += 1;
        }
    }
    let brightness = luma_sum / pixel_count;

    let laplacian = laplacian_filter(&gray);
    let mut response_sum = 0.0_f64;
    for pixel in laplacian.pixels() {
        response_sum += pixel.0[0] as f64;
    }
    let response_mean = response_sum / pixel_count;
    let mut variance = 0.0_f64;
    for pixel in laplacian.pixels() {
        let diff = pixel.0[0] as f64 - response_mean;
        variance += diff * diff;
    }
    let sharpness = variance / pixel_count;

    let clipped_fraction = clipped as f64 / pixel_count;
    let exposure = 100.0 * (1.0 - (5.0 * clipped_fraction).min(1.0));

    let brightness_fit = 100.0 * (1.0 - (brightness - 128.0).abs() / 128.0);
    let sharpness_score = (100.0 * sharpness / SHARPNESS_FULL_SCALE).min(100.0);
    let score =
        0.30 * brightness_fit + 0.50 * sharpness_score + 0.20 * exposure;

    QualityMetrics { brightness, sharpness, exposure, score }
}

// Deterministic lossless encoding of the pixel array. decode() of the
// returned bytes yields the identical raster.
pub fn encode_lossless(image: &RgbImage) -> Result<Vec<u8>, CanonicalError> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(image.as_raw(), image.width(), image.height(),
                     image::ExtendedColorType::Rgb8)
        .map_err(|e| internal_error(&format!("PNG encode failed: {}", e)))?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<RgbImage, CanonicalError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| invalid_argument_error(
            &format!("image decode failed: {}", e)))?;
    Ok(decoded.to_rgb8())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub ok: bool,

    // Hard problems. Resolution mismatch is the only current producer.
    pub issues: Vec<String>,

    // Drift the operator should look at but that does not stop inspection.
    pub warnings: Vec<String>,
}

// Compares the first captured frame of a run against the master. Issues
// surface a warning event on the first cycle; they do not abort inspection.
pub fn consistency_check(master: &RgbImage, captured: &RgbImage)
                         -> ConsistencyReport {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if master.dimensions() != captured.dimensions() {
        issues.push(format!(
            "resolution mismatch: master {}x{}, captured {}x{}",
            master.width(), master.height(),
            captured.width(), captured.height()));
        return ConsistencyReport { ok: false, issues, warnings };
    }

    let master_metrics = quality_metrics(master);
    let captured_metrics = quality_metrics(captured);

    let brightness_base = master_metrics.brightness.max(1.0);
    let brightness_delta =
        (captured_metrics.brightness - master_metrics.brightness).abs()
        / brightness_base;
    if brightness_delta > 0.20 {
        warnings.push(format!(
            "brightness drifted {:.0}% from master ({:.1} vs {:.1})",
            brightness_delta * 100.0,
            captured_metrics.brightness, master_metrics.brightness));
    }

    let sharpness_base = master_metrics.sharpness.max(1e-6);
    let sharpness_ratio = captured_metrics.sharpness / sharpness_base;
    if !(0.7..=1.3).contains(&sharpness_ratio) {
        warnings.push(format!(
            "sharpness ratio {:.2} outside [0.7, 1.3]", sharpness_ratio));
    }

    ConsistencyReport { ok: issues.is_empty(), issues, warnings }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    // The end-to-end scenario raster: mid-gray field with a centered
    // 16x16 white square.
    fn square_master() -> RgbImage {
        let mut image = solid_rgb(64, 64, [128, 128, 128]);
        for y in 24..40 {
            for x in 24..40 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        image
    }

    #[test]
    fn test_to_gray_solid() {
        let gray = to_gray(&solid_rgb(4, 4, [128, 128, 128]));
        assert!(gray.pixels().all(|p| p.0[0] == 128));

        // Pure red maps through the BT.601 weight.
        let gray = to_gray(&solid_rgb(4, 4, [255, 0, 0]));
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn test_to_hsv_primaries() {
        let hsv = to_hsv(&solid_rgb(1, 1, [255, 0, 0]));
        assert_eq!(hsv.get_pixel(0, 0).0, [0, 255, 255]);

        let hsv = to_hsv(&solid_rgb(1, 1, [0, 255, 0]));
        assert_eq!(hsv.get_pixel(0, 0).0, [60, 255, 255]);

        let hsv = to_hsv(&solid_rgb(1, 1, [0, 0, 255]));
        assert_eq!(hsv.get_pixel(0, 0).0, [120, 255, 255]);

        // Gray has no saturation and hue zero.
        let hsv = to_hsv(&solid_rgb(1, 1, [100, 100, 100]));
        assert_eq!(hsv.get_pixel(0, 0).0, [0, 0, 100]);
    }

    #[test]
    fn test_roi_crop_clamps() {
        let image = square_master();
        let crop = roi_crop(&image, &Roi::new(24, 24, 16, 16));
        assert_eq!(crop.dimensions(), (16, 16));
        assert!(crop.pixels().all(|p| p.0 == [255, 255, 255]));

        // Overhanging ROI is clamped, not rejected.
        let crop = roi_crop(&image, &Roi::new(60, 60, 16, 16));
        assert_eq!(crop.dimensions(), (4, 4));

        let crop = roi_crop(&image, &Roi::new(-4, -4, 8, 8));
        assert_eq!(crop.dimensions(), (4, 4));

        // Entirely outside.
        let crop = roi_crop(&image, &Roi::new(100, 100, 8, 8));
        assert_eq!(crop.dimensions(), (0, 0));
    }

    #[test]
    fn test_codec_round_trip() {
        let image = square_master();
        let bytes = encode_lossless(&image).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.dimensions(), image.dimensions());
        assert_eq!(back.as_raw(), image.as_raw());

        // Encoding is deterministic.
        assert_eq!(encode_lossless(&image).unwrap(), bytes);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_quality_metrics_flat_vs_detailed() {
        let flat = quality_metrics(&solid_rgb(32, 32, [128, 128, 128]));
        assert_abs_diff_eq!(flat.brightness, 128.0, epsilon = 0.01);
        assert_abs_diff_eq!(flat.sharpness, 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(flat.exposure, 100.0, epsilon = 0.01);

        let detailed = quality_metrics(&square_master());
        assert!(detailed.sharpness > flat.sharpness);
        assert!(detailed.score > flat.score);
    }

    #[test]
    fn test_quality_metrics_penalizes_clipping() {
        let blown = quality_metrics(&solid_rgb(32, 32, [255, 255, 255]));
        assert_abs_diff_eq!(blown.exposure, 0.0, epsilon = 0.01);
        let ok = quality_metrics(&solid_rgb(32, 32, [128, 128, 128]));
        assert!(blown.score < ok.score);
    }

    #[test]
    fn test_consistency_check_self() {
        let master = square_master();
        let report = consistency_check(&master, &master);
        assert!(report.ok);
        assert!(report.issues.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_consistency_check_resolution_is_hard_issue() {
        let master = square_master();
        let captured = solid_rgb(32, 32, [128, 128, 128]);
        let report = consistency_check(&master, &captured);
        assert!(!report.ok);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn test_consistency_check_brightness_drift_warns() {
        let master = solid_rgb(64, 64, [200, 200, 200]);
        let captured = solid_rgb(64, 64, [100, 100, 100]);
        let report = consistency_check(&master, &captured);
        // Drift is a warning, not an issue; inspection proceeds.
        assert!(report.ok);
        assert!(!report.warnings.is_empty());
    }
}  // mod tests.
