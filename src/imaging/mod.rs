//! Imaging substrate
//!
//! ## Responsibilities
//!
//! - Packed BGR8 frame container shared by the decode loop and recognizers
//! - Perspective warp (3x3 homography, bilinear sampling)
//! - Channel extraction, luminance conversion, Otsu thresholding
//! - RGB -> HSV conversion for color-mode indicator detection
//! - JPEG/PNG encoding and quad annotation for the snapshot surface
//!
//! Everything here is pure: no shared state, no clock, no RNG. Identical
//! input bytes produce identical output bytes.

use crate::config::{ColorChannel, PerspectiveConfig};
use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

/// A decoded video frame, packed BGR8 (row-major, 3 bytes per pixel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame from raw BGR bytes.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(Error::Stream(format!(
                "frame buffer size mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Solid-color frame, mostly useful in tests and for padding.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&bgr);
        }
        Self { width, height, data }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if x < self.width && y < self.height {
            let idx = (y as usize * self.width as usize + x as usize) * 3;
            self.data[idx..idx + 3].copy_from_slice(&bgr);
        }
    }
}

// ========================================
// Perspective warp
// ========================================

/// Warp the configured quad out of `frame` into an `output_size` rectangle.
///
/// The homography maps destination pixels back onto the source quad
/// (TL, TR, BR, BL order) and samples bilinearly; samples outside the source
/// image are black.
pub fn warp_quad(frame: &Frame, perspective: &PerspectiveConfig) -> Result<Frame> {
    if perspective.points.len() != 4 {
        return Err(Error::Recognition(format!(
            "perspective must have 4 points, got {}",
            perspective.points.len()
        )));
    }
    let out_w = perspective.output_width();
    let out_h = perspective.output_height();

    let dst = [
        [0.0, 0.0],
        [(out_w - 1) as f64, 0.0],
        [(out_w - 1) as f64, (out_h - 1) as f64],
        [0.0, (out_h - 1) as f64],
    ];
    let src: Vec<[f64; 2]> = perspective
        .points
        .iter()
        .map(|p| [p[0] as f64, p[1] as f64])
        .collect();

    // Homography from destination rectangle onto the source quad, so each
    // output pixel is an inverse lookup.
    let h = homography(&dst, &[src[0], src[1], src[2], src[3]])?;

    let mut out = Frame::filled(out_w, out_h, [0, 0, 0]);
    for v in 0..out_h {
        for u in 0..out_w {
            let denom = h[6] * u as f64 + h[7] * v as f64 + 1.0;
            if denom.abs() < 1e-12 {
                continue;
            }
            let sx = (h[0] * u as f64 + h[1] * v as f64 + h[2]) / denom;
            let sy = (h[3] * u as f64 + h[4] * v as f64 + h[5]) / denom;
            out.set_pixel(u, v, sample_bilinear(frame, sx, sy));
        }
    }
    Ok(out)
}

/// Solve the 8-parameter homography mapping each `from[i]` onto `to[i]`.
fn homography(from: &[[f64; 2]; 4], to: &[[f64; 2]; 4]) -> Result<[f64; 8]> {
    // Standard 8x8 system: for (u,v) -> (x,y),
    //   a*u + b*v + c - g*u*x - h*v*x = x
    //   d*u + e*v + f - g*u*y - h*v*y = y
    let mut m = [[0.0f64; 9]; 8];
    for i in 0..4 {
        let [u, v] = from[i];
        let [x, y] = to[i];
        m[i * 2] = [u, v, 1.0, 0.0, 0.0, 0.0, -u * x, -v * x, x];
        m[i * 2 + 1] = [0.0, 0.0, 0.0, u, v, 1.0, -u * y, -v * y, y];
    }

    // Gaussian elimination with partial pivoting
    for col in 0..8 {
        let mut pivot = col;
        for row in (col + 1)..8 {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-10 {
            return Err(Error::Recognition("degenerate perspective quad".to_string()));
        }
        m.swap(col, pivot);

        let diag = m[col][col];
        for item in m[col].iter_mut() {
            *item /= diag;
        }
        for row in 0..8 {
            if row != col {
                let factor = m[row][col];
                if factor != 0.0 {
                    for k in 0..9 {
                        m[row][k] -= factor * m[col][k];
                    }
                }
            }
        }
    }

    let mut h = [0.0f64; 8];
    for (i, item) in h.iter_mut().enumerate() {
        *item = m[i][8];
    }
    Ok(h)
}

#[inline]
fn sample_bilinear(frame: &Frame, x: f64, y: f64) -> [u8; 3] {
    if x < 0.0 || y < 0.0 || x > (frame.width - 1) as f64 || y > (frame.height - 1) as f64 {
        return [0, 0, 0];
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(frame.width - 1);
    let y1 = (y0 + 1).min(frame.height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = frame.pixel(x0, y0);
    let p10 = frame.pixel(x1, y0);
    let p01 = frame.pixel(x0, y1);
    let p11 = frame.pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

// ========================================
// Channels, luminance, thresholds
// ========================================

/// Extract one channel (or luminance) as a single-plane image.
pub fn channel_plane(frame: &Frame, channel: ColorChannel) -> Vec<u8> {
    let pixels = frame.width as usize * frame.height as usize;
    let mut plane = Vec::with_capacity(pixels);
    for i in 0..pixels {
        let b = frame.data[i * 3];
        let g = frame.data[i * 3 + 1];
        let r = frame.data[i * 3 + 2];
        let value = match channel {
            ColorChannel::Blue => b,
            ColorChannel::Green => g,
            ColorChannel::Red => r,
            ColorChannel::Gray => luminance(b, g, r),
        };
        plane.push(value);
    }
    plane
}

/// Standard luminance weights: 0.114 B + 0.587 G + 0.299 R
#[inline]
pub fn luminance(b: u8, g: u8, r: u8) -> u8 {
    (0.114 * b as f64 + 0.587 * g as f64 + 0.299 * r as f64)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Otsu's automatic threshold: maximize inter-class variance over the
/// 256-bin histogram.
///
/// Returns T such that values >= T belong to the foreground class (the
/// separating bin itself stays background).
pub fn otsu_threshold(plane: &[u8]) -> u8 {
    let mut histogram = [0u64; 256];
    for &v in plane {
        histogram[v as usize] += 1;
    }
    let total = plane.len() as f64;
    if total == 0.0 {
        return 0;
    }

    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(v, &count)| v as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut best_threshold = 0u8;
    let mut best_variance = -1.0;

    for t in 0..256 {
        weight_background += histogram[t] as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }
        sum_background += t as f64 * histogram[t] as f64;

        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_all - sum_background) / weight_foreground;
        let variance = weight_background
            * weight_foreground
            * (mean_background - mean_foreground)
            * (mean_background - mean_foreground);

        if variance > best_variance {
            best_variance = variance;
            best_threshold = t as u8;
        }
    }
    best_threshold.saturating_add(1)
}

/// Mean value of a plane (0-255)
pub fn mean_level(plane: &[u8]) -> f64 {
    if plane.is_empty() {
        return 0.0;
    }
    plane.iter().map(|&v| v as f64).sum::<f64>() / plane.len() as f64
}

// ========================================
// HSV
// ========================================

/// Convert an RGB triple to (hue 0..360, saturation 0..1, value 0..1).
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let rf = r as f64 / 255.0;
    let gf = g as f64 / 255.0;
    let bf = b as f64 / 255.0;

    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (((gf - bf) / delta).rem_euclid(6.0))
    } else if max == gf {
        60.0 * ((bf - rf) / delta + 2.0)
    } else {
        60.0 * ((rf - gf) / delta + 4.0)
    };

    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation, max)
}

/// Angular distance between two hues in degrees, wrap-aware.
pub fn hue_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

// ========================================
// Encoding & annotation
// ========================================

/// Encode a BGR frame as JPEG at the given quality.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let rgb = bgr_to_rgb(frame);
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| Error::Recognition(format!("jpeg encode failed: {}", e)))?;
    Ok(buf)
}

/// Encode a BGR frame as PNG.
pub fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let rgb = bgr_to_rgb(frame);
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| Error::Recognition(format!("png encode failed: {}", e)))?;
    Ok(buf)
}

/// Encode a single-plane gray image as PNG.
pub fn encode_png_gray(plane: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(plane, width, height, ExtendedColorType::L8)
        .map_err(|e| Error::Recognition(format!("png encode failed: {}", e)))?;
    Ok(buf)
}

/// Decode a JPEG buffer into a BGR frame (preview path).
pub fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| Error::Recognition(format!("jpeg decode failed: {}", e)))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for pixel in rgb.pixels() {
        data.push(pixel[2]);
        data.push(pixel[1]);
        data.push(pixel[0]);
    }
    Frame::from_bgr(width, height, data)
}

fn bgr_to_rgb(frame: &Frame) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.push(chunk[2]);
        rgb.push(chunk[1]);
        rgb.push(chunk[0]);
    }
    rgb
}

/// Draw the outline of a quad onto a frame (annotated snapshot overlay).
pub fn draw_quad(frame: &mut Frame, points: &[[i64; 2]], bgr: [u8; 3]) {
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        draw_line(frame, a, b, bgr);
    }
}

/// Bresenham line draw, clipped to the frame.
fn draw_line(frame: &mut Frame, from: [i64; 2], to: [i64; 2], bgr: [u8; 3]) {
    let (mut x0, mut y0) = (from[0], from[1]);
    let (x1, y1) = (to[0], to[1]);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if x0 >= 0 && y0 >= 0 && (x0 as u32) < frame.width && (y0 as u32) < frame.height {
            frame.set_pixel(x0 as u32, y0 as u32, bgr);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_aligned_warp_is_a_crop() {
        // A frame with a white rectangle at (4,2)-(11,5); warping exactly that
        // region must produce an all-white result.
        let mut frame = Frame::filled(20, 10, [0, 0, 0]);
        for y in 2..=5 {
            for x in 4..=11 {
                frame.set_pixel(x, y, [255, 255, 255]);
            }
        }

        let perspective = PerspectiveConfig {
            points: vec![[4, 2], [11, 2], [11, 5], [4, 5]],
            output_size: [16, 16],
        };
        let warped = warp_quad(&frame, &perspective).unwrap();
        assert_eq!(warped.width, 16);
        assert_eq!(warped.height, 16);
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(warped.pixel(x, y), [255, 255, 255], "at ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn degenerate_quad_errors() {
        let frame = Frame::filled(20, 10, [0, 0, 0]);
        let perspective = PerspectiveConfig {
            // All four points collinear
            points: vec![[0, 0], [5, 0], [10, 0], [15, 0]],
            output_size: [16, 16],
        };
        assert!(warp_quad(&frame, &perspective).is_err());
    }

    #[test]
    fn otsu_separates_bimodal_histogram() {
        let mut plane = vec![20u8; 500];
        plane.extend(vec![220u8; 500]);
        let t = otsu_threshold(&plane);
        assert!(t > 20 && t <= 220, "threshold {} not between modes", t);
    }

    #[test]
    fn luminance_weights() {
        assert_eq!(luminance(0, 0, 255), 76); // pure red
        assert_eq!(luminance(0, 255, 0), 150); // pure green
        assert_eq!(luminance(255, 0, 0), 29); // pure blue
        assert_eq!(luminance(255, 255, 255), 255);
    }

    #[test]
    fn hsv_primaries() {
        let (h, s, v) = rgb_to_hsv(255, 0, 0);
        assert!(h.abs() < 1e-9 && (s - 1.0).abs() < 1e-9 && (v - 1.0).abs() < 1e-9);
        let (h, _, _) = rgb_to_hsv(0, 255, 0);
        assert!((h - 120.0).abs() < 1e-9);
        let (h, _, _) = rgb_to_hsv(0, 0, 255);
        assert!((h - 240.0).abs() < 1e-9);
        let (h, _, _) = rgb_to_hsv(255, 255, 0);
        assert!((h - 60.0).abs() < 1e-9);
    }

    #[test]
    fn hue_distance_wraps() {
        assert!((hue_distance(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((hue_distance(0.0, 180.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn channel_extraction() {
        let frame = Frame::filled(2, 2, [10, 20, 30]); // B=10 G=20 R=30
        assert_eq!(channel_plane(&frame, ColorChannel::Blue), vec![10; 4]);
        assert_eq!(channel_plane(&frame, ColorChannel::Green), vec![20; 4]);
        assert_eq!(channel_plane(&frame, ColorChannel::Red), vec![30; 4]);
    }

    #[test]
    fn jpeg_round_trip_preserves_dimensions() {
        let frame = Frame::filled(32, 24, [40, 80, 120]);
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.width, 32);
        assert_eq!(decoded.height, 24);
    }
}
