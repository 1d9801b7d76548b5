//! Runtime registry
//!
//! ## Responsibilities
//!
//! - Current configuration snapshot (lock-free reads, atomic replacement)
//! - Latest raw/annotated frame per camera
//! - Latest reading per (camera, meter-or-indicator) key
//! - Camera runtime status for the REST contract
//! - Copy-on-write subscriber list fed on every reading emission
//!
//! A slow reader (an MJPEG client holding a frame) never blocks a worker
//! publish: frames and readings live in sharded per-key maps and subscribers
//! receive events through their own bounded queues.

use crate::config::AppConfig;
use crate::export::queue::BoundedQueue;
use crate::imaging::Frame;
use crate::models::{CameraRuntimeStatus, CameraState, ReadingEvent};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Latest frame pair for one camera
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// JPEG-encoded raw frame (quality 80)
    pub raw_jpeg: Arc<Vec<u8>>,
    /// JPEG-encoded frame with meter/indicator outlines drawn
    pub annotated_jpeg: Arc<Vec<u8>>,
    /// Decoded frame kept for the preview path
    pub frame: Arc<Frame>,
    pub captured_at: DateTime<Utc>,
}

/// A registered reading subscriber: a named bounded queue
#[derive(Clone)]
pub struct Subscriber {
    pub name: String,
    pub queue: Arc<BoundedQueue<ReadingEvent>>,
}

/// Process-wide runtime state shared by workers, supervisor, and exporters
pub struct Registry {
    config: ArcSwap<AppConfig>,
    latest_frames: DashMap<String, FrameSnapshot>,
    latest_readings: DashMap<(String, String), ReadingEvent>,
    camera_status: DashMap<String, CameraRuntimeStatus>,
    subscribers: ArcSwap<Vec<Subscriber>>,
}

impl Registry {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            latest_frames: DashMap::new(),
            latest_readings: DashMap::new(),
            camera_status: DashMap::new(),
            subscribers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    // ========================================
    // Config snapshot
    // ========================================

    /// Current snapshot. Lock-free; workers call this at each frame boundary.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    /// Atomically replace the snapshot (reload).
    pub fn swap_config(&self, config: AppConfig) {
        self.config.store(Arc::new(config));
    }

    // ========================================
    // Frames
    // ========================================

    pub fn publish_frame(&self, camera_id: &str, snapshot: FrameSnapshot) {
        self.latest_frames.insert(camera_id.to_string(), snapshot);
    }

    pub fn latest_frame(&self, camera_id: &str) -> Option<FrameSnapshot> {
        self.latest_frames.get(camera_id).map(|e| e.value().clone())
    }

    pub fn drop_frame(&self, camera_id: &str) {
        self.latest_frames.remove(camera_id);
    }

    // ========================================
    // Readings
    // ========================================

    /// Store the event as the latest for its key and fan it out to every
    /// registered subscriber. Never blocks: subscriber queues drop their
    /// oldest item when full.
    pub fn publish_reading(&self, event: ReadingEvent) {
        self.latest_readings.insert(event.key(), event.clone());

        let subscribers = self.subscribers.load();
        for subscriber in subscribers.iter() {
            subscriber.queue.push(event.clone());
        }
    }

    pub fn latest_reading(&self, camera_id: &str, source_id: &str) -> Option<ReadingEvent> {
        self.latest_readings
            .get(&(camera_id.to_string(), source_id.to_string()))
            .map(|e| e.value().clone())
    }

    /// All latest readings for one camera (dashboard surface)
    pub fn latest_readings_for(&self, camera_id: &str) -> Vec<ReadingEvent> {
        self.latest_readings
            .iter()
            .filter(|e| e.key().0 == camera_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove latest readings whose (camera, source) is no longer configured.
    /// Called by the supervisor after a snapshot swap so stale meter ids
    /// disappear from the dashboard immediately.
    pub fn retain_readings(&self, config: &AppConfig) {
        self.latest_readings.retain(|(camera_id, source_id), _| {
            config.camera(camera_id).is_some_and(|camera| {
                camera.meters.iter().any(|m| &m.id == source_id)
                    || camera.indicators.iter().any(|i| &i.id == source_id)
            })
        });
    }

    // ========================================
    // Camera status
    // ========================================

    pub fn set_camera_state(&self, camera_id: &str, name: &str, state: CameraState, error: &str) {
        let mut entry = self
            .camera_status
            .entry(camera_id.to_string())
            .or_insert_with(|| CameraRuntimeStatus::new(camera_id, name));
        entry.state = state;
        entry.error_message = error.to_string();
    }

    pub fn touch_camera_frame(&self, camera_id: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.camera_status.get_mut(camera_id) {
            entry.last_frame_at = Some(at);
        }
    }

    pub fn camera_status(&self, camera_id: &str) -> Option<CameraRuntimeStatus> {
        self.camera_status.get(camera_id).map(|e| e.value().clone())
    }

    pub fn all_camera_status(&self) -> Vec<CameraRuntimeStatus> {
        self.camera_status.iter().map(|e| e.value().clone()).collect()
    }

    pub fn drop_camera_status(&self, camera_id: &str) {
        self.camera_status.remove(camera_id);
    }

    // ========================================
    // Subscribers
    // ========================================

    /// Register a subscriber. The list is copy-on-write: publishers snapshot
    /// the current slice, so registration never races a publish.
    pub fn subscribe(&self, name: &str, capacity: usize) -> Arc<BoundedQueue<ReadingEvent>> {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let subscriber = Subscriber {
            name: name.to_string(),
            queue: queue.clone(),
        };

        self.subscribers.rcu(|current| {
            let mut next = (**current).clone();
            next.push(subscriber.clone());
            next
        });

        tracing::info!(subscriber = %name, capacity = capacity, "Reading subscriber registered");
        queue
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }
}
