//! Runtime data models
//!
//! Configuration snapshots live in [`crate::config`]; everything here is
//! produced at runtime by workers and consumed by the registry and sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera worker state as reported to the status surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Connecting,
    Running,
    Backoff,
    Disabled,
}

impl CameraState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraState::Connecting => "connecting",
            CameraState::Running => "running",
            CameraState::Backoff => "backoff",
            CameraState::Disabled => "disabled",
        }
    }
}

/// A single decoded meter reading.
///
/// A failed recognition is still a Reading: `value` is None, `confidence` is
/// 0 and `raw_text` holds whatever partial text was decoded, so sinks can
/// record the failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub camera_id: String,
    pub meter_id: String,
    pub value: Option<f64>,
    pub raw_text: String,
    pub unit: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Reading for a recognition failure
    pub fn failure(camera_id: &str, meter_id: &str, unit: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            meter_id: meter_id.to_string(),
            value: None,
            raw_text: String::new(),
            unit: unit.to_string(),
            confidence: 0.0,
            timestamp,
        }
    }
}

/// A single indicator lamp observation.
///
/// `score` is the mean gray level (0-255) in brightness mode or the matching
/// color ratio (0-1) in color mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub camera_id: String,
    pub indicator_id: String,
    pub state: bool,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Tagged union carried through the registry and the exporter fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingEvent {
    Meter(Reading),
    Indicator(IndicatorReading),
}

impl ReadingEvent {
    pub fn camera_id(&self) -> &str {
        match self {
            ReadingEvent::Meter(r) => &r.camera_id,
            ReadingEvent::Indicator(r) => &r.camera_id,
        }
    }

    /// Meter or indicator id, depending on the variant
    pub fn source_id(&self) -> &str {
        match self {
            ReadingEvent::Meter(r) => &r.meter_id,
            ReadingEvent::Indicator(r) => &r.indicator_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ReadingEvent::Meter(r) => r.timestamp,
            ReadingEvent::Indicator(r) => r.timestamp,
        }
    }

    /// Registry key for the latest-reading table
    pub fn key(&self) -> (String, String) {
        (self.camera_id().to_string(), self.source_id().to_string())
    }
}

/// Runtime status of one camera, kept current by its worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraRuntimeStatus {
    pub camera_id: String,
    pub name: String,
    pub state: CameraState,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub error_message: String,
}

impl CameraRuntimeStatus {
    pub fn new(camera_id: &str, name: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            name: name.to_string(),
            state: CameraState::Disabled,
            last_frame_at: None,
            error_message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_json_shape() {
        let reading = Reading {
            camera_id: "cam-01".to_string(),
            meter_id: "meter-01".to_string(),
            value: Some(12.34),
            raw_text: "1234".to_string(),
            unit: "kPa".to_string(),
            confidence: 0.95,
            timestamp: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["camera_id"], "cam-01");
        assert_eq!(json["meter_id"], "meter-01");
        assert_eq!(json["value"], 12.34);
        assert_eq!(json["unit"], "kPa");
        assert!(json["timestamp"].as_str().unwrap().starts_with("2025-01-01T00:00:00"));
    }

    #[test]
    fn indicator_event_key() {
        let event = ReadingEvent::Indicator(IndicatorReading {
            camera_id: "cam-01".to_string(),
            indicator_id: "fire-west".to_string(),
            state: true,
            score: 182.4,
            timestamp: Utc::now(),
        });

        assert_eq!(event.key(), ("cam-01".to_string(), "fire-west".to_string()));
    }

    #[test]
    fn failure_reading_is_empty_but_present() {
        let reading = Reading::failure("cam-01", "m1", "kPa", Utc::now());
        assert!(reading.value.is_none());
        assert_eq!(reading.confidence, 0.0);
        assert_eq!(reading.raw_text, "");
    }
}
