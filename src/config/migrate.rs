//! Legacy JSON configuration migration
//!
//! Early deployments stored a single-camera meter list as JSON. `migrate`
//! converts that file into the current YAML model: the meters land on a
//! default camera `cam-01` whose URL is taken from the `RTSP_URL` environment
//! variable at load time.

use crate::config::types::{
    AppConfig, CameraConfig, ColorChannel, DisplayMode, ExportConfig, MeterConfig,
    PerspectiveConfig, RecognitionConfig, ServerConfig,
};
use crate::config::loader;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct LegacyFile {
    #[serde(default)]
    meters: Vec<LegacyMeter>,
}

#[derive(Debug, Deserialize)]
struct LegacyMeter {
    #[serde(default)]
    name: String,
    #[serde(default)]
    perspective: LegacyPerspective,
    #[serde(default)]
    display_mode: Option<String>,
    #[serde(default)]
    color_channel: Option<String>,
    #[serde(default)]
    threshold: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyPerspective {
    #[serde(default)]
    points: Vec<[i64; 2]>,
    #[serde(default)]
    output_width: Option<u32>,
    #[serde(default)]
    output_height: Option<u32>,
}

/// Read a legacy JSON file and build the equivalent snapshot.
pub fn migrate(json_path: &Path) -> Result<AppConfig> {
    if !json_path.exists() {
        return Err(Error::Config(format!(
            "legacy config not found: {}",
            json_path.display()
        )));
    }

    let raw = std::fs::read_to_string(json_path)?;
    let legacy: LegacyFile = serde_json::from_str(&raw)?;

    let mut meters = Vec::new();
    for (i, m) in legacy.meters.iter().enumerate() {
        if m.perspective.points.len() != 4 {
            tracing::warn!(
                meter = %m.name,
                points = m.perspective.points.len(),
                "Skipping legacy meter without 4 perspective points"
            );
            continue;
        }

        let mut perspective = PerspectiveConfig {
            points: m.perspective.points.clone(),
            output_size: [
                m.perspective.output_width.unwrap_or(400),
                m.perspective.output_height.unwrap_or(100),
            ],
        };
        loader::normalize_points(&mut perspective);

        let name = if m.name.is_empty() {
            format!("Meter {}", i + 1)
        } else {
            m.name.clone()
        };

        meters.push(MeterConfig {
            id: format!("meter-{:02}", i + 1),
            name,
            perspective,
            recognition: RecognitionConfig {
                display_mode: parse_display_mode(m.display_mode.as_deref()),
                color_channel: parse_color_channel(m.color_channel.as_deref()),
                threshold: m.threshold.unwrap_or(0),
            },
            expected_digits: 0,
            decimal_places: 0,
            unit: String::new(),
            show_on_dashboard: true,
        });
    }

    let cameras = if meters.is_empty() {
        Vec::new()
    } else {
        vec![CameraConfig {
            id: "cam-01".to_string(),
            name: "Default Camera".to_string(),
            url: "${RTSP_URL}".to_string(),
            enabled: true,
            processing_interval_seconds: 1.0,
            meters,
            indicators: Vec::new(),
        }]
    };

    Ok(AppConfig {
        cameras,
        export: ExportConfig::default(),
        server: ServerConfig::default(),
    })
}

/// Migrate and write the result as canonical YAML, backing up the JSON file.
pub fn migrate_to_yaml(json_path: &Path, yaml_path: &Path) -> Result<AppConfig> {
    let config = migrate(json_path)?;
    loader::save(&config, yaml_path)?;

    let backup = json_path.with_extension("json.bak");
    if !backup.exists() {
        std::fs::rename(json_path, &backup)?;
        tracing::info!(backup = %backup.display(), "Backed up legacy config");
    }

    tracing::info!(path = %yaml_path.display(), "Migrated config saved");
    Ok(config)
}

fn parse_display_mode(value: Option<&str>) -> DisplayMode {
    match value {
        Some("dark_on_light") => DisplayMode::DarkOnLight,
        _ => DisplayMode::LightOnDark,
    }
}

fn parse_color_channel(value: Option<&str>) -> ColorChannel {
    match value {
        Some("green") => ColorChannel::Green,
        Some("blue") => ColorChannel::Blue,
        Some("gray") => ColorChannel::Gray,
        _ => ColorChannel::Red,
    }
}
