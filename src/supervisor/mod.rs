//! Supervisor
//!
//! ## Responsibilities
//!
//! - Reconcile the running camera worker set against the current snapshot
//! - Hot reload: load + validate, atomically swap, reconcile
//! - Cooperative worker stop with a bounded grace period
//! - Whole-service shutdown
//!
//! Reconcile rules per camera: present in target but not running -> spawn;
//! present in both with a deep-equal definition -> leave alone; definition
//! changed -> stop old, spawn new; running but absent or disabled -> stop.

use crate::camera_worker::{self, WorkerHandle};
use crate::config::{self, AppConfig};
use crate::error::Result;
use crate::models::CameraState;
use crate::registry::Registry;
use crate::stream::FrameSource;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Grace period for one worker's frame loop to exit
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor<S: FrameSource + Clone> {
    source: S,
    registry: Arc<Registry>,
    config_path: PathBuf,
    workers: HashMap<String, WorkerHandle>,
}

impl<S: FrameSource + Clone> Supervisor<S> {
    pub fn new(source: S, registry: Arc<Registry>, config_path: PathBuf) -> Self {
        Self {
            source,
            registry,
            config_path,
            workers: HashMap::new(),
        }
    }

    /// Reconcile workers against the registry's current snapshot.
    pub async fn start(&mut self) {
        let snapshot = self.registry.config();
        self.apply(&snapshot).await;
    }

    /// Load the config file again and, on success, swap the snapshot and
    /// reconcile. A failed load leaves the running snapshot untouched.
    pub async fn reload(&mut self) -> Result<()> {
        let snapshot = config::load(&self.config_path)?;
        tracing::info!(path = %self.config_path.display(), "Configuration reloaded");

        self.registry.swap_config(snapshot.clone());
        self.registry.retain_readings(&snapshot);
        self.apply(&snapshot).await;
        Ok(())
    }

    /// Diff the running worker set against the target snapshot.
    pub async fn apply(&mut self, target: &AppConfig) {
        let mut keep = HashMap::new();
        let mut to_stop = Vec::new();

        for (camera_id, handle) in self.workers.drain() {
            match target.camera(&camera_id) {
                Some(camera) if camera.enabled && *camera == handle.camera => {
                    keep.insert(camera_id, handle);
                }
                Some(camera) if camera.enabled => {
                    tracing::info!(camera_id = %camera_id, "Camera definition changed, restarting worker");
                    to_stop.push(handle);
                }
                _ => {
                    tracing::info!(camera_id = %camera_id, "Camera removed or disabled, stopping worker");
                    to_stop.push(handle);
                }
            }
        }
        self.workers = keep;

        for handle in to_stop {
            let camera_id = handle.camera.id.clone();
            handle.stop(STOP_GRACE).await;
            match target.camera(&camera_id) {
                Some(camera) if !camera.enabled => {
                    self.registry
                        .set_camera_state(&camera_id, &camera.name, CameraState::Disabled, "");
                }
                Some(_) => {}
                None => {
                    self.registry.drop_camera_status(&camera_id);
                    self.registry.drop_frame(&camera_id);
                }
            }
        }

        for camera in &target.cameras {
            if !camera.enabled {
                self.registry
                    .set_camera_state(&camera.id, &camera.name, CameraState::Disabled, "");
                continue;
            }
            if !self.workers.contains_key(&camera.id) {
                tracing::info!(camera_id = %camera.id, name = %camera.name, "Spawning camera worker");
                let handle = camera_worker::spawn(
                    self.source.clone(),
                    self.registry.clone(),
                    camera.clone(),
                );
                self.workers.insert(camera.id.clone(), handle);
            }
        }

        tracing::info!(workers = self.workers.len(), "Worker set reconciled");
    }

    /// Stop every worker (shutdown is reconcile against the empty target).
    pub async fn shutdown(&mut self) {
        tracing::info!(workers = self.workers.len(), "Supervisor shutting down");
        for (_, handle) in self.workers.drain() {
            handle.stop(STOP_GRACE).await;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        self.workers.contains_key(camera_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_worker::test_support::TestSource;
    use crate::config::CameraConfig;
    use crate::imaging::Frame;

    fn camera(id: &str, url: &str) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: id.to_string(),
            url: url.to_string(),
            enabled: true,
            processing_interval_seconds: 1.0,
            meters: Vec::new(),
            indicators: Vec::new(),
        }
    }

    fn snapshot(cameras: Vec<CameraConfig>) -> AppConfig {
        AppConfig {
            cameras,
            ..AppConfig::default()
        }
    }

    fn supervisor(initial: AppConfig) -> Supervisor<TestSource> {
        let source = TestSource::new(Frame::filled(16, 16, [0, 0, 0]), Duration::from_millis(10));
        let registry = Arc::new(Registry::new(initial));
        Supervisor::new(source, registry, PathBuf::from("/nonexistent/config.yaml"))
    }

    #[tokio::test]
    async fn spawns_workers_for_enabled_cameras() {
        let mut disabled = camera("cam-02", "rtsp://b/1");
        disabled.enabled = false;
        let target = snapshot(vec![camera("cam-01", "rtsp://a/1"), disabled]);

        let mut supervisor = supervisor(target.clone());
        supervisor.start().await;

        assert_eq!(supervisor.worker_count(), 1);
        assert!(supervisor.is_running("cam-01"));
        assert!(!supervisor.is_running("cam-02"));

        supervisor.shutdown().await;
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn unchanged_definition_is_left_alone() {
        let target = snapshot(vec![camera("cam-01", "rtsp://a/1")]);
        let mut supervisor = supervisor(target.clone());
        supervisor.start().await;
        assert_eq!(supervisor.worker_count(), 1);

        // Reconciling the identical target keeps the same worker set
        supervisor.apply(&target).await;
        assert_eq!(supervisor.worker_count(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn changed_definition_restarts_the_worker() {
        let before = snapshot(vec![camera("cam-01", "rtsp://a/1")]);
        let mut supervisor = supervisor(before.clone());
        supervisor.start().await;

        let after = snapshot(vec![camera("cam-01", "rtsp://a/NEW")]);
        supervisor.registry.swap_config(after.clone());
        supervisor.apply(&after).await;

        assert_eq!(supervisor.worker_count(), 1);
        assert!(supervisor.is_running("cam-01"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn removed_camera_is_stopped_and_forgotten() {
        let before = snapshot(vec![camera("cam-01", "rtsp://a/1")]);
        let mut supervisor = supervisor(before.clone());
        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = snapshot(vec![]);
        supervisor.registry.swap_config(after.clone());
        supervisor.apply(&after).await;

        assert_eq!(supervisor.worker_count(), 0);
        assert!(supervisor.registry.camera_status("cam-01").is_none());
        assert!(supervisor.registry.latest_frame("cam-01").is_none());
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_running_snapshot() {
        let target = snapshot(vec![camera("cam-01", "rtsp://a/1")]);
        let mut supervisor = supervisor(target.clone());
        supervisor.start().await;

        // Config path does not exist: reload must fail and change nothing
        let result = supervisor.reload().await;
        assert!(result.is_err());
        assert_eq!(supervisor.worker_count(), 1);
        assert_eq!(supervisor.registry.config().cameras.len(), 1);
        supervisor.shutdown().await;
    }
}
