//! Seven-segment digit recognition
//!
//! ## Pipeline
//!
//! 1. Perspective warp of the configured quad
//! 2. Channel extraction (red/green/blue/gray)
//! 3. Binarization (fixed threshold or Otsu when threshold = 0)
//! 4. Connected-component digit segmentation (4-connectivity)
//! 5. Per-digit seven-segment classification
//! 6. Text assembly, decimal normalization, float parse
//!
//! The recognizer is a pure function of the frame bytes and the meter
//! configuration. Failures are values: a readout with `value = None` and
//! `confidence = 0`, never a panic. Only malformed geometry (degenerate
//! warp quad) surfaces as an error, which the camera worker converts into a
//! failure Reading.

use crate::config::{DisplayMode, MeterConfig};
use crate::error::Result;
use crate::imaging::{self, Frame};

/// Segment order: a (top), b (top-right), c (bottom-right), d (bottom),
/// e (bottom-left), f (top-left), g (middle).
const SEGMENT_PATTERNS: [([u8; 7], char); 10] = [
    ([1, 1, 1, 1, 1, 1, 0], '0'),
    ([0, 1, 1, 0, 0, 0, 0], '1'),
    ([1, 1, 0, 1, 1, 0, 1], '2'),
    ([1, 1, 1, 1, 0, 0, 1], '3'),
    ([0, 1, 1, 0, 0, 1, 1], '4'),
    ([1, 0, 1, 1, 0, 1, 1], '5'),
    ([1, 0, 1, 1, 1, 1, 1], '6'),
    ([1, 1, 1, 0, 0, 0, 0], '7'),
    ([1, 1, 1, 1, 1, 1, 1], '8'),
    ([1, 1, 1, 1, 0, 1, 1], '9'),
];

/// Sample regions for the seven segments as (x1, y1, x2, y2) ratios of the
/// digit bounding box. The regions deliberately avoid each other so a lit
/// neighbor never bleeds into the wrong sample.
const SEGMENT_REGIONS: [[f64; 4]; 7] = [
    [0.20, 0.02, 0.80, 0.12], // a: top
    [0.70, 0.15, 0.98, 0.42], // b: top-right
    [0.70, 0.58, 0.98, 0.85], // c: bottom-right
    [0.20, 0.88, 0.80, 0.98], // d: bottom
    [0.02, 0.58, 0.30, 0.85], // e: bottom-left
    [0.02, 0.15, 0.30, 0.42], // f: top-left
    [0.20, 0.44, 0.80, 0.56], // g: middle
];

/// Fraction of lit pixels a segment region needs to count as on
const SEGMENT_ON_RATIO: f64 = 0.5;
/// Minimum component height relative to the warped height to be a digit
const DIGIT_MIN_HEIGHT_RATIO: f64 = 0.4;
/// Minimum component area relative to the warped area to be a digit
const DIGIT_MIN_AREA_RATIO: f64 = 0.02;
/// Maximum component height relative to the warped height to be a decimal dot
const DOT_MAX_HEIGHT_RATIO: f64 = 0.3;
/// Bounding boxes narrower than this ratio of their height can only be a "1";
/// segment sampling inside such a box would see every region lit.
const ONE_MAX_ASPECT: f64 = 0.35;

/// Result of one recognition pass
#[derive(Debug, Clone)]
pub struct MeterReadout {
    pub value: Option<f64>,
    pub raw_text: String,
    pub confidence: f64,
    pub debug: RecognitionDebug,
}

/// Intermediate artifacts for the preview/debug surface
#[derive(Debug, Clone)]
pub struct RecognitionDebug {
    /// Warped BGR region
    pub warped: Frame,
    /// Binary lit-mask (0 or 255 per pixel) at warped dimensions
    pub thresholded: Vec<u8>,
}

/// A connected component of lit pixels
#[derive(Debug, Clone)]
struct Component {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
    centroid_x: f64,
}

impl Component {
    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Recognize the meter region of `frame` described by `config`.
pub fn read_meter(frame: &Frame, config: &MeterConfig) -> Result<MeterReadout> {
    let warped = imaging::warp_quad(frame, &config.perspective)?;
    let plane = imaging::channel_plane(&warped, config.recognition.color_channel);

    let threshold = if config.recognition.threshold == 0 {
        imaging::otsu_threshold(&plane)
    } else {
        config.recognition.threshold
    };

    let width = warped.width;
    let height = warped.height;
    let lit: Vec<bool> = plane
        .iter()
        .map(|&v| match config.recognition.display_mode {
            DisplayMode::LightOnDark => v >= threshold,
            DisplayMode::DarkOnLight => v < threshold,
        })
        .collect();

    let thresholded: Vec<u8> = lit.iter().map(|&on| if on { 255u8 } else { 0u8 }).collect();
    let debug = RecognitionDebug {
        warped,
        thresholded,
    };

    let components = connected_components(&lit, width, height);

    let area_total = (width * height) as f64;
    let mut digits: Vec<&Component> = components
        .iter()
        .filter(|c| {
            c.height() as f64 >= DIGIT_MIN_HEIGHT_RATIO * height as f64
                && c.area as f64 >= DIGIT_MIN_AREA_RATIO * area_total
        })
        .collect();
    digits.sort_by(|a, b| a.centroid_x.total_cmp(&b.centroid_x));

    // Decimal dots: short isolated blobs sitting to the right of some digit
    let mut dots: Vec<&Component> = components
        .iter()
        .filter(|c| {
            (c.height() as f64) < DOT_MAX_HEIGHT_RATIO * height as f64
                && digits.iter().any(|d| c.centroid_x > d.centroid_x)
                && !digits.iter().any(|d| std::ptr::eq(*d, *c))
        })
        .collect();
    dots.sort_by(|a, b| a.centroid_x.total_cmp(&b.centroid_x));

    if digits.is_empty() {
        return Ok(MeterReadout {
            value: None,
            raw_text: String::new(),
            confidence: 0.0,
            debug,
        });
    }

    // Classify each digit and interleave the dots by x position
    let mut glyphs: Vec<(f64, char, Option<f64>)> = Vec::new();
    let mut all_matched = true;
    for digit in &digits {
        match classify_digit(&lit, width, digit) {
            Some((ch, clarity)) => glyphs.push((digit.centroid_x, ch, Some(clarity))),
            None => {
                all_matched = false;
                glyphs.push((digit.centroid_x, '?', None));
            }
        }
    }
    for dot in &dots {
        glyphs.push((dot.centroid_x, '.', None));
    }
    glyphs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let raw_text: String = glyphs.iter().map(|(_, ch, _)| *ch).collect();
    let clarities: Vec<f64> = glyphs.iter().filter_map(|(_, _, c)| *c).collect();

    let digit_count = digits.len() as u32;
    let count_ok = config.expected_digits == 0 || digit_count == config.expected_digits;

    if !all_matched || !count_ok {
        return Ok(MeterReadout {
            value: None,
            raw_text,
            confidence: 0.0,
            debug,
        });
    }

    let value = parse_value(&raw_text, config.decimal_places);
    let confidence = if value.is_some() && !clarities.is_empty() {
        clarities.iter().sum::<f64>() / clarities.len() as f64
    } else {
        0.0
    };

    Ok(MeterReadout {
        value,
        raw_text,
        confidence,
        debug,
    })
}

/// Label 4-connected components of lit pixels.
fn connected_components(lit: &[bool], width: u32, height: u32) -> Vec<Component> {
    let w = width as usize;
    let h = height as usize;
    let mut visited = vec![false; w * h];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for start in 0..(w * h) {
        if !lit[start] || visited[start] {
            continue;
        }

        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut area = 0u32;
        let mut sum_x = 0f64;

        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let x = (idx % w) as u32;
            let y = (idx / w) as u32;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            area += 1;
            sum_x += x as f64;

            if x > 0 {
                try_visit(lit, &mut visited, &mut stack, idx - 1);
            }
            if x + 1 < width {
                try_visit(lit, &mut visited, &mut stack, idx + 1);
            }
            if y > 0 {
                try_visit(lit, &mut visited, &mut stack, idx - w);
            }
            if y + 1 < height {
                try_visit(lit, &mut visited, &mut stack, idx + w);
            }
        }

        components.push(Component {
            min_x,
            min_y,
            max_x,
            max_y,
            area,
            centroid_x: sum_x / area as f64,
        });
    }
    components
}

#[inline]
fn try_visit(lit: &[bool], visited: &mut [bool], stack: &mut Vec<usize>, idx: usize) {
    if lit[idx] && !visited[idx] {
        visited[idx] = true;
        stack.push(idx);
    }
}

/// Classify one digit's bounding box against the segment table.
///
/// Returns the decoded character and its clarity (1.0 when every segment
/// region is unambiguously on or off), or None when the measured pattern
/// matches no digit.
fn classify_digit(lit: &[bool], width: u32, component: &Component) -> Option<(char, f64)> {
    let bw = component.width() as f64;
    let bh = component.height() as f64;

    if bw < ONE_MAX_ASPECT * bh {
        // The box is the b/c bar itself; clarity is how solidly it is filled.
        let fill = component.area as f64 / (bw * bh);
        return Some(('1', fill.min(1.0)));
    }

    let mut pattern = [0u8; 7];
    let mut clarity_sum = 0.0;
    for (i, region) in SEGMENT_REGIONS.iter().enumerate() {
        let x1 = component.min_x + (bw * region[0]) as u32;
        let y1 = component.min_y + (bh * region[1]) as u32;
        let x2 = component.min_x + (bw * region[2]).ceil() as u32;
        let y2 = component.min_y + (bh * region[3]).ceil() as u32;
        let x2 = x2.min(component.max_x + 1).max(x1 + 1);
        let y2 = y2.min(component.max_y + 1).max(y1 + 1);

        let mut on = 0u32;
        let mut total = 0u32;
        for y in y1..y2 {
            for x in x1..x2 {
                total += 1;
                if lit[(y * width + x) as usize] {
                    on += 1;
                }
            }
        }

        let ratio = if total > 0 { on as f64 / total as f64 } else { 0.0 };
        pattern[i] = if ratio > SEGMENT_ON_RATIO { 1 } else { 0 };
        clarity_sum += 1.0 - 2.0 * ratio.min(1.0 - ratio);
    }

    let clarity = clarity_sum / 7.0;
    SEGMENT_PATTERNS
        .iter()
        .find(|(p, _)| *p == pattern)
        .map(|(_, ch)| (*ch, clarity))
}

/// Normalize assembled text and parse it as a float.
///
/// More than one decimal point rejects the value. When `decimal_places > 0`
/// and the text carries no dot, one is inserted before the last
/// `decimal_places` characters ("123" with 2 places reads as 1.23).
fn parse_value(raw_text: &str, decimal_places: u32) -> Option<f64> {
    let dots = raw_text.chars().filter(|&c| c == '.').count();
    if dots > 1 {
        return None;
    }

    let normalized = if decimal_places > 0 && dots == 0 {
        let len = raw_text.len();
        let dp = decimal_places as usize;
        if len > dp {
            let (head, tail) = raw_text.split_at(len - dp);
            format!("{}.{}", head, tail)
        } else {
            format!("0.{}{}", "0".repeat(dp - len), raw_text)
        }
    } else {
        raw_text.to_string()
    };

    normalized.parse::<f64>().ok()
}


#[cfg(test)]
mod tests {
    use super::test_support::render_display;
    use super::*;
    use crate::config::{ColorChannel, PerspectiveConfig, RecognitionConfig};

    fn meter_config(expected_digits: u32, decimal_places: u32) -> MeterConfig {
        MeterConfig {
            id: "m1".to_string(),
            name: "m1".to_string(),
            perspective: PerspectiveConfig {
                points: vec![[0, 0], [199, 0], [199, 59], [0, 59]],
                output_size: [200, 60],
            },
            recognition: RecognitionConfig {
                display_mode: DisplayMode::LightOnDark,
                color_channel: ColorChannel::Gray,
                threshold: 128,
            },
            expected_digits,
            decimal_places,
            unit: "kPa".to_string(),
            show_on_dashboard: true,
        }
    }

    #[test]
    fn reads_lit_digits() {
        let frame = render_display("123", 200, 60, [255, 255, 255], [0, 0, 0]);
        let readout = read_meter(&frame, &meter_config(3, 0)).unwrap();
        assert_eq!(readout.raw_text, "123");
        assert_eq!(readout.value, Some(123.0));
        assert!(readout.confidence >= 0.9, "confidence {}", readout.confidence);
    }

    #[test]
    fn decimal_places_shift_the_value() {
        let frame = render_display("123", 200, 60, [255, 255, 255], [0, 0, 0]);
        let readout = read_meter(&frame, &meter_config(3, 2)).unwrap();
        assert_eq!(readout.raw_text, "123");
        assert_eq!(readout.value, Some(1.23));
        assert!(readout.confidence >= 0.9);
    }

    #[test]
    fn dark_on_light_reads_the_same_text() {
        let frame = render_display("123", 200, 60, [10, 10, 10], [240, 240, 240]);
        let mut config = meter_config(3, 2);
        config.recognition.display_mode = DisplayMode::DarkOnLight;
        config.recognition.threshold = 200;
        let readout = read_meter(&frame, &config).unwrap();
        assert_eq!(readout.raw_text, "123");
        assert_eq!(readout.value, Some(1.23));
    }

    #[test]
    fn digit_count_mismatch_keeps_partial_text() {
        let frame = render_display("12", 200, 60, [255, 255, 255], [0, 0, 0]);
        let readout = read_meter(&frame, &meter_config(3, 0)).unwrap();
        assert_eq!(readout.raw_text, "12");
        assert_eq!(readout.value, None);
        assert_eq!(readout.confidence, 0.0);
    }

    #[test]
    fn auto_digit_count_accepts_any() {
        let frame = render_display("405", 200, 60, [255, 255, 255], [0, 0, 0]);
        let readout = read_meter(&frame, &meter_config(0, 0)).unwrap();
        assert_eq!(readout.raw_text, "405");
        assert_eq!(readout.value, Some(405.0));
    }

    #[test]
    fn decimal_point_component_is_detected() {
        let frame = render_display("1.5", 200, 60, [255, 255, 255], [0, 0, 0]);
        let readout = read_meter(&frame, &meter_config(0, 0)).unwrap();
        assert_eq!(readout.raw_text, "1.5");
        assert_eq!(readout.value, Some(1.5));
    }

    #[test]
    fn empty_region_reports_failure_value() {
        let frame = Frame::filled(200, 60, [0, 0, 0]);
        let mut config = meter_config(0, 0);
        // Fixed threshold: an all-black frame has no lit pixels
        config.recognition.threshold = 128;
        let readout = read_meter(&frame, &config).unwrap();
        assert_eq!(readout.value, None);
        assert_eq!(readout.raw_text, "");
        assert_eq!(readout.confidence, 0.0);
    }

    #[test]
    fn otsu_auto_threshold_reads_digits() {
        let frame = render_display("88", 200, 60, [200, 200, 200], [30, 30, 30]);
        let mut config = meter_config(2, 0);
        config.recognition.threshold = 0;
        let readout = read_meter(&frame, &config).unwrap();
        assert_eq!(readout.raw_text, "88");
        assert_eq!(readout.value, Some(88.0));
    }

    #[test]
    fn all_ten_digits_classify() {
        for d in 0..10u32 {
            let text = d.to_string();
            let frame = render_display(&text, 200, 60, [255, 255, 255], [0, 0, 0]);
            let readout = read_meter(&frame, &meter_config(1, 0)).unwrap();
            assert_eq!(readout.raw_text, text, "digit {}", d);
            assert_eq!(readout.value, Some(d as f64), "digit {}", d);
        }
    }

    #[test]
    fn parse_value_rules() {
        assert_eq!(parse_value("123", 0), Some(123.0));
        assert_eq!(parse_value("123", 2), Some(1.23));
        assert_eq!(parse_value("1.23", 2), Some(1.23));
        assert_eq!(parse_value("12", 2), Some(0.12));
        assert_eq!(parse_value("1", 2), Some(0.01));
        assert_eq!(parse_value("1.2.3", 0), None);
        assert_eq!(parse_value("", 0), None);
    }
}
