//! Indicator lamp detection
//!
//! Two modes, both pure functions of the frame and configuration:
//!
//! - **Brightness**: mean gray level of the warped region against a fixed or
//!   Otsu threshold. Score is the mean level (0-255).
//! - **Color**: fraction of warped pixels whose HSV lies near the configured
//!   lamp color (hue within 15 degrees, saturation >= 0.4, value >= 0.3)
//!   against `ratio_threshold`. Score is the ratio (0-1).
//!
//! No debouncing happens here; callers that need flicker suppression apply
//! their own policy.

use crate::config::{ColorChannel, DetectionMode, IndicatorConfig};
use crate::error::Result;
use crate::imaging::{self, Frame};

/// Hue tolerance around the canonical lamp color, degrees
const HUE_TOLERANCE: f64 = 15.0;
/// Minimum saturation for a pixel to count in color mode
const MIN_SATURATION: f64 = 0.4;
/// Minimum value (brightness) for a pixel to count in color mode
const MIN_VALUE: f64 = 0.3;

/// Result of one detection pass
#[derive(Debug, Clone)]
pub struct IndicatorReadout {
    pub state: bool,
    /// Mean gray (0-255) in brightness mode, color ratio (0-1) in color mode
    pub score: f64,
    pub debug: IndicatorDebug,
}

/// Intermediate artifacts for the preview/debug surface
#[derive(Debug, Clone)]
pub struct IndicatorDebug {
    /// Warped BGR region
    pub warped: Frame,
    /// Gray plane (brightness mode) or match mask (color mode), 0/255
    pub thresholded: Vec<u8>,
}

/// Detect the lamp state in the region of `frame` described by `config`.
pub fn read_indicator(frame: &Frame, config: &IndicatorConfig) -> Result<IndicatorReadout> {
    let warped = imaging::warp_quad(frame, &config.perspective)?;

    match config.detection.mode {
        DetectionMode::Brightness => detect_brightness(warped, config),
        DetectionMode::Color => detect_color(warped, config),
    }
}

fn detect_brightness(warped: Frame, config: &IndicatorConfig) -> Result<IndicatorReadout> {
    let gray = imaging::channel_plane(&warped, ColorChannel::Gray);
    let mean = imaging::mean_level(&gray);

    let threshold = if config.detection.threshold == 0 {
        imaging::otsu_threshold(&gray)
    } else {
        config.detection.threshold
    };

    let state = mean >= threshold as f64;
    Ok(IndicatorReadout {
        state,
        score: mean,
        debug: IndicatorDebug {
            warped,
            thresholded: gray,
        },
    })
}

fn detect_color(warped: Frame, config: &IndicatorConfig) -> Result<IndicatorReadout> {
    let target_hue = config.detection.on_color.canonical_hue();
    let total = (warped.width * warped.height) as f64;

    let mut mask = Vec::with_capacity(total as usize);
    let mut matching = 0u64;
    for chunk in warped.data.chunks_exact(3) {
        let (hue, saturation, value) = imaging::rgb_to_hsv(chunk[2], chunk[1], chunk[0]);
        let hit = imaging::hue_distance(hue, target_hue) <= HUE_TOLERANCE
            && saturation >= MIN_SATURATION
            && value >= MIN_VALUE;
        if hit {
            matching += 1;
        }
        mask.push(if hit { 255u8 } else { 0u8 });
    }

    let ratio = if total > 0.0 { matching as f64 / total } else { 0.0 };
    let state = ratio >= config.detection.ratio_threshold;

    Ok(IndicatorReadout {
        state,
        score: ratio,
        debug: IndicatorDebug {
            warped,
            thresholded: mask,
        },
    })
}
