//! Configuration model and loader
//!
//! ## Responsibilities
//!
//! - Immutable configuration snapshots (cameras, meters, indicators, sinks)
//! - YAML loading with environment variable substitution
//! - Validation with dotted-path error reporting
//! - Canonical YAML saving for round-trip stability
//! - Legacy JSON migration

pub mod loader;
pub mod migrate;
pub mod types;

pub use loader::{default_config_path, load, load_str, resolve_config_path, save};
pub use types::{
    AppConfig, CameraConfig, ColorChannel, DatabaseExportConfig, DatabaseKind, DetectionConfig,
    DetectionMode, DisplayMode, ExportConfig, HttpExportConfig, IndicatorConfig, MeterConfig,
    MqttExportConfig, OnColor, PerspectiveConfig, RecognitionConfig, ServerConfig,
};
