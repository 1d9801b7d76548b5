//! MeterEye
//!
//! Multi-camera monitoring for seven-segment meters and indicator lamps.
//!
//! ## Components
//!
//! 1. config - immutable snapshots, YAML loader, hot reload, migration
//! 2. imaging - warp, thresholding, encoding substrate
//! 3. recognition - seven-segment digit recognizer
//! 4. indicator - lamp on/off detector
//! 5. stream - ffmpeg-backed RTSP frame acquisition
//! 6. camera_worker - soft-real-time per-camera loop
//! 7. registry - process-wide shared state (snapshot, frames, readings)
//! 8. export - dispatcher and HTTP/database/MQTT sinks
//! 9. supervisor - worker reconciliation and shutdown
//! 10. preview - ad-hoc recognition for the configuration UI
//!
//! ## Design principles
//!
//! - Configuration is replaced wholesale; nothing mutates a snapshot
//! - Recognizers are pure functions; failure is a value, not a panic
//! - Workers never block on a slow consumer: every fan-out queue is bounded
//!   and drops its oldest item

pub mod camera_worker;
pub mod config;
pub mod error;
pub mod export;
pub mod imaging;
pub mod indicator;
pub mod models;
pub mod preview;
pub mod recognition;
pub mod registry;
pub mod stream;
pub mod supervisor;

pub use error::{Error, Result};
pub use registry::Registry;
