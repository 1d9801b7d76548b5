//! Camera worker
//!
//! ## State machine
//!
//! ```text
//! Connecting -> Running -> (read gap / decode error) -> Backoff -> Connecting
//!     |            |                                       |
//!     +------------+------------- stop signal -------------+--> Stopping
//! ```
//!
//! One worker per enabled camera. Each frame iteration loads the current
//! configuration snapshot, so meters and indicators added or removed by a
//! reload take effect at the next frame without restarting the stream. A
//! worker whose camera disappears from the snapshot stops itself.
//!
//! Frame pacing: at most one processed frame per
//! `processing_interval_seconds`; every decoded frame in between is drained
//! and discarded so the newest one is processed. Recognition failures never
//! abort the loop; they are emitted as failure Readings and logged at most
//! once per (meter, error kind) per minute.

use crate::config::CameraConfig;
use crate::error::Error;
use crate::imaging::{self, Frame};
use crate::indicator;
use crate::models::{CameraState, IndicatorReading, Reading, ReadingEvent};
use crate::recognition;
use crate::registry::{FrameSnapshot, Registry};
use crate::stream::{FrameConnection, FrameSource};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Frame read timeout; a longer gap sends the worker into Backoff
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// JPEG quality for published snapshots
const SNAPSHOT_JPEG_QUALITY: u8 = 80;
/// Minimum interval between identical error log lines per meter
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Meter outline color in annotated snapshots (BGR green)
const METER_OUTLINE: [u8; 3] = [0, 255, 0];
/// Indicator outline color in annotated snapshots (BGR yellow)
const INDICATOR_OUTLINE: [u8; 3] = [0, 255, 255];

/// Handle to a running worker, owned by the supervisor
pub struct WorkerHandle {
    /// Camera definition the worker was spawned with (reconcile diff input)
    pub camera: CameraConfig,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop and wait up to `grace` for its loop to
    /// exit. Returns false when the worker had to be abandoned.
    pub async fn stop(self, grace: Duration) -> bool {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(grace, self.task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(camera_id = %self.camera.id, "Worker did not stop in time, abandoning");
                false
            }
        }
    }
}

/// Spawn a worker task for one camera.
pub fn spawn<S: FrameSource>(
    source: S,
    registry: Arc<Registry>,
    camera: CameraConfig,
) -> WorkerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let camera_id = camera.id.clone();
    let task = tokio::spawn(run(source, registry, camera_id, stop_rx));
    WorkerHandle { camera, stop_tx, task }
}

/// Exponential reconnect backoff: 1, 2, 4, ... seconds capped at 30.
#[derive(Debug, Default)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    const CAP_SECS: u64 = 30;

    fn next_delay(&mut self) -> Duration {
        let secs = 1u64
            .checked_shl(self.attempt)
            .unwrap_or(Self::CAP_SECS)
            .min(Self::CAP_SECS);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs(secs)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Rate limiter for recognition error logging
#[derive(Default)]
struct LogThrottle {
    last: HashMap<(String, &'static str), Instant>,
}

impl LogThrottle {
    fn should_log(&mut self, source_id: &str, kind: &'static str) -> bool {
        let key = (source_id.to_string(), kind);
        let now = Instant::now();
        match self.last.get(&key) {
            Some(&at) if now.duration_since(at) < ERROR_LOG_INTERVAL => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::Config(_) => "config",
        Error::Stream(_) => "stream",
        Error::Recognition(_) => "recognition",
        Error::Export(_) => "export",
        Error::Registry(_) => "registry",
        Error::NoFrame(_) => "no_frame",
        Error::Database(_) => "database",
        Error::Serialization(_) => "serialization",
        Error::Yaml(_) => "yaml",
        Error::Http(_) => "http",
        Error::Io(_) => "io",
    }
}

async fn run<S: FrameSource>(
    source: S,
    registry: Arc<Registry>,
    camera_id: String,
    mut stop: watch::Receiver<bool>,
) {
    tracing::info!(camera_id = %camera_id, "Camera worker started");
    let mut backoff = Backoff::default();
    let mut throttle = LogThrottle::default();

    'lifecycle: loop {
        if *stop.borrow() {
            break;
        }

        // Each connection attempt starts from the current snapshot
        let Some(camera) = registry.config().camera(&camera_id).cloned() else {
            tracing::info!(camera_id = %camera_id, "Camera removed from config, stopping worker");
            break;
        };
        if !camera.enabled {
            registry.set_camera_state(&camera_id, &camera.name, CameraState::Disabled, "");
            break;
        }

        registry.set_camera_state(&camera_id, &camera.name, CameraState::Connecting, "");

        let connected = tokio::select! {
            result = source.connect(&camera.url) => result,
            _ = stop.changed() => break,
        };

        match connected {
            Ok(mut connection) => {
                registry.set_camera_state(&camera_id, &camera.name, CameraState::Running, "");
                backoff.reset();
                tracing::info!(camera_id = %camera_id, "Camera connected");

                let mut next_process_at = Instant::now();
                loop {
                    if *stop.borrow() {
                        break 'lifecycle;
                    }

                    // Snapshot read at the frame boundary: a reload is
                    // honored at the next frame
                    let snapshot = registry.config();
                    let Some(camera) = snapshot.camera(&camera_id) else {
                        tracing::info!(camera_id = %camera_id, "Camera removed from config, stopping worker");
                        break 'lifecycle;
                    };
                    if !camera.enabled {
                        registry.set_camera_state(&camera_id, &camera.name, CameraState::Disabled, "");
                        break 'lifecycle;
                    }

                    let frame = tokio::select! {
                        result = connection.read_frame(FRAME_READ_TIMEOUT) => result,
                        _ = stop.changed() => break 'lifecycle,
                    };

                    match frame {
                        Ok(frame) => {
                            let now = Instant::now();
                            if now < next_process_at {
                                // Drain: newer frames replace this one before
                                // the next processing slot
                                continue;
                            }
                            process_frame(&registry, camera, &frame, &mut throttle);
                            next_process_at =
                                now + Duration::from_secs_f64(camera.processing_interval_seconds);
                        }
                        Err(e) => {
                            tracing::warn!(camera_id = %camera_id, error = %e, "Frame read failed");
                            registry.set_camera_state(
                                &camera_id,
                                &camera.name,
                                CameraState::Backoff,
                                &e.to_string(),
                            );
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, error = %e, "Camera connect failed");
                registry.set_camera_state(
                    &camera_id,
                    &camera.name,
                    CameraState::Backoff,
                    &e.to_string(),
                );
            }
        }

        // Backoff before the next Connecting attempt
        let delay = backoff.next_delay();
        tracing::debug!(camera_id = %camera_id, delay_sec = delay.as_secs(), "Reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }

    tracing::info!(camera_id = %camera_id, "Camera worker stopped");
}

/// Run every meter and indicator of `camera` over one frame and publish the
/// results plus the latest raw/annotated snapshots.
fn process_frame(
    registry: &Registry,
    camera: &CameraConfig,
    frame: &Frame,
    throttle: &mut LogThrottle,
) {
    let timestamp = Utc::now();

    for meter in &camera.meters {
        let reading = match recognition::read_meter(frame, meter) {
            Ok(readout) => Reading {
                camera_id: camera.id.clone(),
                meter_id: meter.id.clone(),
                value: readout.value,
                raw_text: readout.raw_text,
                unit: meter.unit.clone(),
                confidence: readout.confidence,
                timestamp,
            },
            Err(e) => {
                let kind = error_kind(&e);
                if throttle.should_log(&meter.id, kind) {
                    tracing::warn!(
                        camera_id = %camera.id,
                        meter_id = %meter.id,
                        kind = kind,
                        error = %e,
                        "Meter recognition failed"
                    );
                }
                Reading::failure(&camera.id, &meter.id, &meter.unit, timestamp)
            }
        };
        registry.publish_reading(ReadingEvent::Meter(reading));
    }

    for indicator_config in &camera.indicators {
        let reading = match indicator::read_indicator(frame, indicator_config) {
            Ok(readout) => IndicatorReading {
                camera_id: camera.id.clone(),
                indicator_id: indicator_config.id.clone(),
                state: readout.state,
                score: readout.score,
                timestamp,
            },
            Err(e) => {
                let kind = error_kind(&e);
                if throttle.should_log(&indicator_config.id, kind) {
                    tracing::warn!(
                        camera_id = %camera.id,
                        indicator_id = %indicator_config.id,
                        kind = kind,
                        error = %e,
                        "Indicator detection failed"
                    );
                }
                IndicatorReading {
                    camera_id: camera.id.clone(),
                    indicator_id: indicator_config.id.clone(),
                    state: false,
                    score: 0.0,
                    timestamp,
                }
            }
        };
        registry.publish_reading(ReadingEvent::Indicator(reading));
    }

    publish_snapshots(registry, camera, frame);
    registry.touch_camera_frame(&camera.id, timestamp);
}

/// Encode and store the raw and annotated JPEG snapshots.
fn publish_snapshots(registry: &Registry, camera: &CameraConfig, frame: &Frame) {
    let raw_jpeg = match imaging::encode_jpeg(frame, SNAPSHOT_JPEG_QUALITY) {
        Ok(jpeg) => jpeg,
        Err(e) => {
            tracing::warn!(camera_id = %camera.id, error = %e, "Snapshot encode failed");
            return;
        }
    };

    let mut annotated = frame.clone();
    for meter in &camera.meters {
        imaging::draw_quad(&mut annotated, &meter.perspective.points, METER_OUTLINE);
    }
    for indicator_config in &camera.indicators {
        imaging::draw_quad(
            &mut annotated,
            &indicator_config.perspective.points,
            INDICATOR_OUTLINE,
        );
    }
    let annotated_jpeg = match imaging::encode_jpeg(&annotated, SNAPSHOT_JPEG_QUALITY) {
        Ok(jpeg) => jpeg,
        Err(e) => {
            tracing::warn!(camera_id = %camera.id, error = %e, "Annotated snapshot encode failed");
            return;
        }
    };

    registry.publish_frame(
        &camera.id,
        FrameSnapshot {
            raw_jpeg: Arc::new(raw_jpeg),
            annotated_jpeg: Arc::new(annotated_jpeg),
            frame: Arc::new(frame.clone()),
            captured_at: Utc::now(),
        },
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Synthetic source delivering a fixed frame on a timer; optionally
    /// fails the first N connection attempts.
    #[derive(Clone)]
    pub struct TestSource {
        pub frame: Arc<Mutex<Frame>>,
        pub period: Duration,
        pub failing_connects: Arc<AtomicU32>,
        pub connect_count: Arc<AtomicU32>,
    }

    impl TestSource {
        pub fn new(frame: Frame, period: Duration) -> Self {
            Self {
                frame: Arc::new(Mutex::new(frame)),
                period,
                failing_connects: Arc::new(AtomicU32::new(0)),
                connect_count: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl FrameSource for TestSource {
        type Connection = TestConnection;

        async fn connect(&self, _url: &str) -> Result<TestConnection> {
            self.connect_count.fetch_add(1, Ordering::SeqCst);
            if self.failing_connects.load(Ordering::SeqCst) > 0 {
                self.failing_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Stream("connection refused".to_string()));
            }
            Ok(TestConnection {
                frame: self.frame.clone(),
                period: self.period,
            })
        }
    }

    pub struct TestConnection {
        frame: Arc<Mutex<Frame>>,
        period: Duration,
    }

    impl FrameConnection for TestConnection {
        async fn read_frame(&mut self, _timeout: Duration) -> Result<Frame> {
            tokio::time::sleep(self.period).await;
            Ok(self.frame.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestSource;
    use super::*;
    use crate::config::{
        AppConfig, ColorChannel, DisplayMode, MeterConfig, PerspectiveConfig, RecognitionConfig,
    };
    use crate::recognition::test_support::render_display;
    use std::sync::atomic::Ordering;

    fn meter(id: &str) -> MeterConfig {
        MeterConfig {
            id: id.to_string(),
            name: id.to_string(),
            perspective: PerspectiveConfig {
                points: vec![[0, 0], [199, 0], [199, 59], [0, 59]],
                output_size: [200, 60],
            },
            recognition: RecognitionConfig {
                display_mode: DisplayMode::LightOnDark,
                color_channel: ColorChannel::Gray,
                threshold: 128,
            },
            expected_digits: 3,
            decimal_places: 2,
            unit: "kPa".to_string(),
            show_on_dashboard: true,
        }
    }

    fn camera(id: &str, interval: f64, meters: Vec<MeterConfig>) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: id.to_string(),
            url: "rtsp://test/1".to_string(),
            enabled: true,
            processing_interval_seconds: interval,
            meters,
            indicators: Vec::new(),
        }
    }

    fn registry_with(cameras: Vec<CameraConfig>) -> Arc<Registry> {
        Arc::new(Registry::new(AppConfig {
            cameras,
            ..AppConfig::default()
        }))
    }

    #[tokio::test]
    async fn emits_readings_and_snapshots() {
        let frame = render_display("123", 200, 60, [255, 255, 255], [0, 0, 0]);
        let source = TestSource::new(frame, Duration::from_millis(10));
        let registry = registry_with(vec![camera("cam-01", 0.1, vec![meter("m1")])]);
        let events = registry.subscribe("test", 64);

        let handle = spawn(source, registry.clone(), registry.config().cameras[0].clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.stop(Duration::from_secs(2)).await);

        let event = events.try_pop().expect("no reading emitted");
        match event {
            ReadingEvent::Meter(r) => {
                assert_eq!(r.camera_id, "cam-01");
                assert_eq!(r.meter_id, "m1");
                assert_eq!(r.raw_text, "123");
                assert_eq!(r.value, Some(1.23));
                assert!(r.confidence >= 0.9);
            }
            _ => panic!("expected meter reading"),
        }

        let snapshot = registry.latest_frame("cam-01").expect("no frame published");
        assert!(!snapshot.raw_jpeg.is_empty());
        assert!(!snapshot.annotated_jpeg.is_empty());
        assert_eq!(snapshot.frame.width, 200);
    }

    #[tokio::test]
    async fn paces_processing_to_the_interval() {
        let frame = render_display("1", 200, 60, [255, 255, 255], [0, 0, 0]);
        // Frames arrive every 10ms but the interval is 100ms
        let source = TestSource::new(frame, Duration::from_millis(10));
        let registry = registry_with(vec![camera("cam-01", 0.1, vec![meter("m1")])]);
        let events = registry.subscribe("test", 256);

        let handle = spawn(source, registry.clone(), registry.config().cameras[0].clone());
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(handle.stop(Duration::from_secs(2)).await);

        let mut timestamps = Vec::new();
        while let Some(event) = events.try_pop() {
            timestamps.push(event.timestamp());
        }
        assert!(timestamps.len() >= 2, "only {} readings", timestamps.len());
        // No more than one reading per interval (with scheduling slack)
        assert!(timestamps.len() <= 7, "{} readings in 450ms", timestamps.len());
        for pair in timestamps.windows(2) {
            let gap = (pair[1] - pair[0]).num_milliseconds();
            assert!(gap >= 50, "gap {}ms below interval - epsilon", gap);
        }
    }

    #[tokio::test]
    async fn recognition_failure_emits_failure_reading() {
        let frame = render_display("1", 200, 60, [255, 255, 255], [0, 0, 0]);
        let source = TestSource::new(frame, Duration::from_millis(10));

        // Degenerate quad: warp fails, the worker must emit a failure Reading
        let mut broken = meter("m1");
        broken.perspective.points = vec![[0, 0], [50, 0], [100, 0], [150, 0]];
        let registry = registry_with(vec![camera("cam-01", 0.1, vec![broken])]);
        let events = registry.subscribe("test", 64);

        let handle = spawn(source, registry.clone(), registry.config().cameras[0].clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.stop(Duration::from_secs(2)).await);

        let event = events.try_pop().expect("no reading emitted");
        match event {
            ReadingEvent::Meter(r) => {
                assert_eq!(r.value, None);
                assert_eq!(r.confidence, 0.0);
                assert_eq!(r.raw_text, "");
            }
            _ => panic!("expected meter reading"),
        }
        // The failure is also the latest reading for the key
        assert!(registry.latest_reading("cam-01", "m1").is_some());
    }

    #[tokio::test]
    async fn reload_swaps_meters_at_the_next_frame() {
        let frame = render_display("123", 200, 60, [255, 255, 255], [0, 0, 0]);
        let source = TestSource::new(frame, Duration::from_millis(10));
        let registry = registry_with(vec![camera("cam-01", 0.1, vec![meter("m1")])]);
        let events = registry.subscribe("test", 256);

        let handle = spawn(source, registry.clone(), registry.config().cameras[0].clone());
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Replace m1 with m2 and swap the snapshot
        let swapped = AppConfig {
            cameras: vec![camera("cam-01", 0.1, vec![meter("m2")])],
            ..AppConfig::default()
        };
        registry.swap_config(swapped.clone());
        registry.retain_readings(&swapped);
        let swap_at = Utc::now();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.stop(Duration::from_secs(2)).await);

        // Allow one in-flight frame over the boundary, then only m2
        let boundary = swap_at + chrono::Duration::milliseconds(200);
        let mut saw_m2 = false;
        while let Some(event) = events.try_pop() {
            if event.timestamp() > boundary {
                assert_eq!(event.source_id(), "m2", "stale meter id after swap");
            }
            if event.source_id() == "m2" {
                saw_m2 = true;
            }
        }
        assert!(saw_m2, "no m2 readings after swap");

        // One in-flight frame may have republished m1 between the swap and
        // the retain; reconcile runs retain again once workers quiesce
        registry.retain_readings(&swapped);
        assert!(registry.latest_reading("cam-01", "m1").is_none());
    }

    #[tokio::test]
    async fn worker_stops_when_camera_is_removed() {
        let frame = render_display("1", 200, 60, [255, 255, 255], [0, 0, 0]);
        let source = TestSource::new(frame, Duration::from_millis(10));
        let registry = registry_with(vec![camera("cam-01", 0.1, vec![meter("m1")])]);

        let handle = spawn(source, registry.clone(), registry.config().cameras[0].clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        registry.swap_config(AppConfig::default());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The task has already exited on its own; stop resolves immediately
        assert!(handle.stop(Duration::from_millis(500)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off() {
        let frame = Frame::filled(16, 16, [0, 0, 0]);
        let source = TestSource::new(frame, Duration::from_millis(10));
        source.failing_connects.store(u32::MAX, Ordering::SeqCst);
        let connect_count = source.connect_count.clone();

        let registry = registry_with(vec![camera("cam-01", 0.1, vec![])]);
        let handle = spawn(source, registry.clone(), registry.config().cameras[0].clone());

        // Paused time auto-advances through the backoff sleeps:
        // attempts at t=0, 1, 3, 7, 15s
        tokio::time::sleep(Duration::from_secs(16)).await;
        let attempts = connect_count.load(Ordering::SeqCst);
        assert!((4..=6).contains(&attempts), "{} attempts in 16s", attempts);

        let status = registry.camera_status("cam-01").unwrap();
        assert_eq!(status.state, CameraState::Backoff);
        assert!(status.error_message.contains("connection refused"));

        assert!(handle.stop(Duration::from_secs(2)).await);
    }

    #[test]
    fn backoff_schedule() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 1);
    }

    #[test]
    fn log_throttle_limits_per_kind() {
        let mut throttle = LogThrottle::default();
        assert!(throttle.should_log("m1", "recognition"));
        assert!(!throttle.should_log("m1", "recognition"));
        // Different kind or meter logs independently
        assert!(throttle.should_log("m1", "stream"));
        assert!(throttle.should_log("m2", "recognition"));
    }
}
