//! Preview service
//!
//! Synchronous on-demand recognition: run an ad-hoc meter or indicator
//! configuration against a camera's latest frame and return the result with
//! debug artifacts (warped and thresholded images as PNG). The operator UI
//! uses this to tune perspective points and thresholds before saving them.
//!
//! The only state shared with the worker loop is the latest-frame read.

use crate::config::{IndicatorConfig, MeterConfig};
use crate::error::{Error, Result};
use crate::imaging;
use crate::indicator;
use crate::recognition;
use crate::registry::Registry;

/// What to run against the latest frame
#[derive(Debug, Clone)]
pub enum PreviewTarget {
    Meter(MeterConfig),
    Indicator(IndicatorConfig),
}

/// Recognition outcome without the runtime envelope
#[derive(Debug, Clone)]
pub enum PreviewOutcome {
    Meter {
        value: Option<f64>,
        raw_text: String,
        confidence: f64,
    },
    Indicator {
        state: bool,
        score: f64,
    },
}

#[derive(Debug, Clone)]
pub struct PreviewResult {
    pub outcome: PreviewOutcome,
    pub warped_png: Vec<u8>,
    pub thresholded_png: Vec<u8>,
}

/// Run `target` against the latest frame of `camera_id`.
///
/// Fails with [`Error::NoFrame`] when the camera has not produced a frame
/// yet (the REST layer maps this to 409).
pub fn preview(registry: &Registry, camera_id: &str, target: &PreviewTarget) -> Result<PreviewResult> {
    let snapshot = registry
        .latest_frame(camera_id)
        .ok_or_else(|| Error::NoFrame(format!("camera '{}'", camera_id)))?;
    let frame = snapshot.frame.as_ref();

    match target {
        PreviewTarget::Meter(config) => {
            let readout = recognition::read_meter(frame, config)?;
            let warped_png = imaging::encode_png(&readout.debug.warped)?;
            let thresholded_png = imaging::encode_png_gray(
                &readout.debug.thresholded,
                readout.debug.warped.width,
                readout.debug.warped.height,
            )?;
            Ok(PreviewResult {
                outcome: PreviewOutcome::Meter {
                    value: readout.value,
                    raw_text: readout.raw_text,
                    confidence: readout.confidence,
                },
                warped_png,
                thresholded_png,
            })
        }
        PreviewTarget::Indicator(config) => {
            let readout = indicator::read_indicator(frame, config)?;
            let warped_png = imaging::encode_png(&readout.debug.warped)?;
            let thresholded_png = imaging::encode_png_gray(
                &readout.debug.thresholded,
                readout.debug.warped.width,
                readout.debug.warped.height,
            )?;
            Ok(PreviewResult {
                outcome: PreviewOutcome::Indicator {
                    state: readout.state,
                    score: readout.score,
                },
                warped_png,
                thresholded_png,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AppConfig, ColorChannel, DisplayMode, PerspectiveConfig, RecognitionConfig,
    };
    use crate::recognition::test_support::render_display;
    use crate::registry::FrameSnapshot;
    use chrono::Utc;
    use std::sync::Arc;

    fn meter() -> MeterConfig {
        MeterConfig {
            id: "preview".to_string(),
            name: "preview".to_string(),
            perspective: PerspectiveConfig {
                points: vec![[0, 0], [199, 0], [199, 59], [0, 59]],
                output_size: [200, 60],
            },
            recognition: RecognitionConfig {
                display_mode: DisplayMode::LightOnDark,
                color_channel: ColorChannel::Gray,
                threshold: 128,
            },
            expected_digits: 0,
            decimal_places: 0,
            unit: String::new(),
            show_on_dashboard: true,
        }
    }

    fn registry_with_frame() -> Registry {
        let registry = Registry::new(AppConfig::default());
        let frame = render_display("42", 200, 60, [255, 255, 255], [0, 0, 0]);
        registry.publish_frame(
            "cam-01",
            FrameSnapshot {
                raw_jpeg: Arc::new(Vec::new()),
                annotated_jpeg: Arc::new(Vec::new()),
                frame: Arc::new(frame),
                captured_at: Utc::now(),
            },
        );
        registry
    }

    #[test]
    fn previews_a_meter_against_the_latest_frame() {
        let registry = registry_with_frame();
        let result = preview(&registry, "cam-01", &PreviewTarget::Meter(meter())).unwrap();

        match result.outcome {
            PreviewOutcome::Meter { value, raw_text, .. } => {
                assert_eq!(raw_text, "42");
                assert_eq!(value, Some(42.0));
            }
            _ => panic!("expected meter outcome"),
        }
        // PNG magic bytes
        assert_eq!(&result.warped_png[..4], &[0x89, b'P', b'N', b'G']);
        assert_eq!(&result.thresholded_png[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn no_frame_yet_is_an_error() {
        let registry = Registry::new(AppConfig::default());
        let err = preview(&registry, "cam-01", &PreviewTarget::Meter(meter())).unwrap_err();
        assert!(matches!(err, Error::NoFrame(_)), "{}", err);
    }
}
