//! YAML configuration loading, validation, and canonical saving
//!
//! `load` reads a YAML file, substitutes `${NAME}` / `${NAME:-default}`
//! expansions in every string scalar from the process environment, parses
//! into the typed snapshot, validates, and normalizes perspective points.
//! Validation failures name the first offending field as a dotted path
//! (e.g. `cameras[0].meters[1].perspective.points`).
//!
//! `save` writes canonical YAML: fixed key order (struct declaration order),
//! 2-space indent, no anchors. `save(load(x))` followed by `load` is
//! byte-for-byte stable.

use crate::config::types::{AppConfig, CameraConfig, PerspectiveConfig};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Load and validate a configuration snapshot from a YAML file.
pub fn load(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path)?;
    load_str(&raw)
}

/// Load and validate a configuration snapshot from YAML text.
pub fn load_str(raw: &str) -> Result<AppConfig> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    substitute_env(&mut value)?;

    let mut config: AppConfig = serde_yaml::from_value(value)?;
    validate(&config)?;
    normalize(&mut config);
    Ok(config)
}

/// Write a snapshot as canonical YAML.
pub fn save(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Default config location: `$XDG_CONFIG_HOME/ctme/config.yaml`, with
/// `~/.config` standing in when XDG_CONFIG_HOME is unset.
pub fn default_config_path() -> PathBuf {
    let xdg_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    xdg_dir.join("ctme").join("config.yaml")
}

/// Resolve the effective config file path for the CLI.
///
/// Order: explicit `--config`, the default location, `./config.yaml`,
/// `./config.example.yaml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }

    let default = default_config_path();
    if default.exists() {
        return default;
    }

    let local = PathBuf::from("config.yaml");
    if local.exists() {
        return local;
    }
    PathBuf::from("config.example.yaml")
}

// ========================================
// Environment substitution
// ========================================

/// Recursively substitute environment expansions in every string scalar.
fn substitute_env(value: &mut serde_yaml::Value) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = expand_env(s)?;
            Ok(())
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                substitute_env(item)?;
            }
            Ok(())
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Expand `${NAME}` and `${NAME:-default}` in a single string.
fn expand_env(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::Config(format!("unterminated ${{...}} in '{}'", input)))?;
        let expr = &after[..end];

        let (name, default) = match expr.find(":-") {
            Some(idx) => (&expr[..idx], Some(&expr[idx + 2..])),
            None => (expr, None),
        };

        match std::env::var(name) {
            Ok(val) => out.push_str(&val),
            Err(_) => match default {
                Some(d) => out.push_str(d),
                None => {
                    return Err(Error::Config(format!(
                        "environment variable '{}' is not set and no default provided",
                        name
                    )))
                }
            },
        }

        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ========================================
// Validation
// ========================================

fn validate(config: &AppConfig) -> Result<()> {
    let mut camera_ids = HashSet::new();
    for (ci, camera) in config.cameras.iter().enumerate() {
        let cam_path = format!("cameras[{}]", ci);

        if camera.id.is_empty() {
            return Err(Error::config_at(format!("{}.id", cam_path), "must not be empty"));
        }
        if camera.id.len() > 64 {
            return Err(Error::config_at(
                format!("{}.id", cam_path),
                "must be at most 64 characters",
            ));
        }
        if !camera_ids.insert(camera.id.clone()) {
            return Err(Error::config_at(
                format!("{}.id", cam_path),
                format!("duplicate camera id '{}'", camera.id),
            ));
        }
        if camera.url.is_empty() {
            return Err(Error::config_at(format!("{}.url", cam_path), "must not be empty"));
        }
        if camera.processing_interval_seconds < 0.1 {
            return Err(Error::config_at(
                format!("{}.processing_interval_seconds", cam_path),
                "must be at least 0.1",
            ));
        }

        let mut meter_ids = HashSet::new();
        for (mi, meter) in camera.meters.iter().enumerate() {
            let meter_path = format!("{}.meters[{}]", cam_path, mi);
            if meter.id.is_empty() {
                return Err(Error::config_at(format!("{}.id", meter_path), "must not be empty"));
            }
            if !meter_ids.insert(meter.id.clone()) {
                return Err(Error::config_at(
                    format!("{}.id", meter_path),
                    format!("duplicate meter id '{}'", meter.id),
                ));
            }
            validate_perspective(&meter.perspective, &format!("{}.perspective", meter_path))?;
        }

        let mut indicator_ids = HashSet::new();
        for (ii, indicator) in camera.indicators.iter().enumerate() {
            let ind_path = format!("{}.indicators[{}]", cam_path, ii);
            if indicator.id.is_empty() {
                return Err(Error::config_at(format!("{}.id", ind_path), "must not be empty"));
            }
            if !indicator_ids.insert(indicator.id.clone()) {
                return Err(Error::config_at(
                    format!("{}.id", ind_path),
                    format!("duplicate indicator id '{}'", indicator.id),
                ));
            }
            validate_perspective(&indicator.perspective, &format!("{}.perspective", ind_path))?;

            let ratio = indicator.detection.ratio_threshold;
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::config_at(
                    format!("{}.detection.ratio_threshold", ind_path),
                    "must be within 0..1",
                ));
            }
        }
    }

    if config.export.mqtt.qos > 2 {
        return Err(Error::config_at("export.mqtt.qos", "must be 0, 1 or 2"));
    }
    if config.export.http.enabled && config.export.http.url.is_empty() {
        return Err(Error::config_at("export.http.url", "required when http export is enabled"));
    }

    Ok(())
}

fn validate_perspective(perspective: &PerspectiveConfig, path: &str) -> Result<()> {
    if perspective.points.len() != 4 {
        return Err(Error::config_at(
            format!("{}.points", path),
            format!("must have exactly 4 points, got {}", perspective.points.len()),
        ));
    }
    for point in &perspective.points {
        if point[0] < 0 || point[1] < 0 {
            return Err(Error::config_at(
                format!("{}.points", path),
                "coordinates must be non-negative",
            ));
        }
    }
    if perspective.output_size[0] < 16 || perspective.output_size[1] < 16 {
        return Err(Error::config_at(
            format!("{}.output_size", path),
            "width and height must be at least 16",
        ));
    }
    Ok(())
}

// ========================================
// Normalization
// ========================================

fn normalize(config: &mut AppConfig) {
    for camera in &mut config.cameras {
        normalize_camera(camera);
    }
}

fn normalize_camera(camera: &mut CameraConfig) {
    if camera.name.is_empty() {
        camera.name = camera.id.clone();
    }
    for meter in &mut camera.meters {
        if meter.name.is_empty() {
            meter.name = meter.id.clone();
        }
        normalize_points(&mut meter.perspective);
    }
    for indicator in &mut camera.indicators {
        if indicator.name.is_empty() {
            indicator.name = indicator.id.clone();
        }
        normalize_points(&mut indicator.perspective);
    }
}

/// Reorder the four corners into TL, TR, BR, BL using the y-then-x rule:
/// the two points with smaller y form the top edge (left first), the two
/// with larger y the bottom edge.
pub fn normalize_points(perspective: &mut PerspectiveConfig) {
    let mut pts = perspective.points.clone();
    pts.sort_by_key(|p| (p[1], p[0]));

    let (top, bottom) = pts.split_at(2);
    let (tl, tr) = if top[0][0] <= top[1][0] {
        (top[0], top[1])
    } else {
        (top[1], top[0])
    };
    let (bl, br) = if bottom[0][0] <= bottom[1][0] {
        (bottom[0], bottom[1])
    } else {
        (bottom[1], bottom[0])
    };

    perspective.points = vec![tl, tr, br, bl];
}
