//! Configuration data types
//!
//! Every struct here is an immutable snapshot: the loader builds a whole
//! `AppConfig`, validation runs once, and running code only ever swaps the
//! complete value. Unknown YAML keys are rejected at every level.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Display polarity for seven-segment recognition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    LightOnDark,
    DarkOnLight,
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self::LightOnDark
    }
}

/// Source channel used for thresholding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorChannel {
    Red,
    Green,
    Blue,
    Gray,
}

impl Default for ColorChannel {
    fn default() -> Self {
        Self::Red
    }
}

/// Indicator detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Brightness,
    Color,
}

impl Default for DetectionMode {
    fn default() -> Self {
        Self::Brightness
    }
}

/// Lamp color matched in color detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnColor {
    Red,
    Green,
    Blue,
    Yellow,
}

impl Default for OnColor {
    fn default() -> Self {
        Self::Red
    }
}

impl OnColor {
    /// Canonical hue in degrees. Red wraps around 360.
    pub fn canonical_hue(&self) -> f64 {
        match self {
            OnColor::Red => 0.0,
            OnColor::Yellow => 60.0,
            OnColor::Green => 120.0,
            OnColor::Blue => 240.0,
        }
    }
}

/// Four-point perspective region mapped onto an axis-aligned rectangle.
///
/// After loading, `points` are normalized to TL, TR, BR, BL order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerspectiveConfig {
    /// Source quad corners in image coordinates
    pub points: Vec<[i64; 2]>,
    /// Warp target size [width, height]
    #[serde(default = "default_output_size")]
    pub output_size: [u32; 2],
}

fn default_output_size() -> [u32; 2] {
    [400, 100]
}

impl PerspectiveConfig {
    pub fn output_width(&self) -> u32 {
        self.output_size[0]
    }

    pub fn output_height(&self) -> u32 {
        self.output_size[1]
    }
}

/// Recognition tuning for one meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub color_channel: ColorChannel,
    /// Binarization threshold, 0 selects Otsu's automatic threshold
    #[serde(default)]
    pub threshold: u8,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            display_mode: DisplayMode::default(),
            color_channel: ColorChannel::default(),
            threshold: 0,
        }
    }
}

/// One seven-segment meter on a camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub perspective: PerspectiveConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    /// Expected digit count; 0 accepts any count >= 1
    #[serde(default)]
    pub expected_digits: u32,
    /// Implied decimal places when the display carries no dot
    #[serde(default)]
    pub decimal_places: u32,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_true")]
    pub show_on_dashboard: bool,
}

/// Detection tuning for one indicator lamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    #[serde(default)]
    pub mode: DetectionMode,
    /// Brightness threshold, 0 selects Otsu. Unused in color mode.
    #[serde(default = "default_indicator_threshold")]
    pub threshold: u8,
    #[serde(default)]
    pub on_color: OnColor,
    /// Matching pixel ratio required for ON in color mode
    #[serde(default = "default_ratio_threshold")]
    pub ratio_threshold: f64,
}

fn default_indicator_threshold() -> u8 {
    128
}

fn default_ratio_threshold() -> f64 {
    0.2
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            threshold: default_indicator_threshold(),
            on_color: OnColor::default(),
            ratio_threshold: default_ratio_threshold(),
        }
    }
}

/// One on/off indicator lamp on a camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndicatorConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub perspective: PerspectiveConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default = "default_true")]
    pub show_on_dashboard: bool,
}

/// One camera with its meters and indicators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// RTSP source URL, may contain `${VAR}` / `${VAR:-default}` expansions
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_processing_interval")]
    pub processing_interval_seconds: f64,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
    #[serde(default)]
    pub indicators: Vec<IndicatorConfig>,
}

fn default_processing_interval() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// HTTP sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpExportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_http_interval")]
    pub interval_seconds: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: f64,
}

fn default_http_interval() -> f64 {
    5.0
}

fn default_batch_size() -> usize {
    10
}

fn default_http_timeout() -> f64 {
    10.0
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            interval_seconds: default_http_interval(),
            batch_size: default_batch_size(),
            headers: BTreeMap::new(),
            timeout_seconds: default_http_timeout(),
        }
    }
}

/// Database backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    Postgresql,
}

impl Default for DatabaseKind {
    fn default() -> Self {
        Self::Sqlite
    }
}

/// Database sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseExportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: DatabaseKind,
    /// SQLite file path (sqlite only)
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Full connection string (postgresql, overrides `path` for sqlite)
    #[serde(default)]
    pub connection_string: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_db_path() -> String {
    "./readings.db".to_string()
}

fn default_retention_days() -> u32 {
    30
}

impl Default for DatabaseExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: DatabaseKind::default(),
            path: default_db_path(),
            connection_string: String::new(),
            retention_days: default_retention_days(),
        }
    }
}

/// MQTT sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttExportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic with `{camera_id}` / `{meter_id}` / `{indicator_id}` placeholders
    #[serde(default = "default_topic_template")]
    pub topic_template: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_template() -> String {
    "ctme/readings".to_string()
}

fn default_qos() -> u8 {
    1
}

impl Default for MqttExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: default_broker(),
            port: default_mqtt_port(),
            topic_template: default_topic_template(),
            qos: default_qos(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Combined sink configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    #[serde(default)]
    pub http: HttpExportConfig,
    #[serde(default)]
    pub database: DatabaseExportConfig,
    #[serde(default)]
    pub mqtt: MqttExportConfig,
}

/// API server binding. The serving layer itself lives outside this crate;
/// the keys are parsed and validated here so it has something to consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_server_port(),
        }
    }
}

/// Top-level application configuration snapshot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Look up a camera by id
    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }
}
