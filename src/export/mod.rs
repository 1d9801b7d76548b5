//! Exporter fan-out
//!
//! ## Responsibilities
//!
//! - Single dispatcher consuming every reading from all camera workers
//!   through a bounded (1024) drop-oldest queue
//! - One bounded (1000) queue + consumer task per enabled sink
//! - Sinks: HTTP batching POST, SQLite/PostgreSQL persistence, MQTT publish
//!
//! Sinks are independent: a stalled or failing sink only ever loses its own
//! readings, never another sink's and never a worker's time.

pub mod database;
pub mod http;
pub mod mqtt;
pub mod queue;

use crate::config::ExportConfig;
use crate::models::ReadingEvent;
use crate::registry::Registry;
use queue::BoundedQueue;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Dispatcher inbox capacity
pub const DISPATCHER_CAPACITY: usize = 1024;
/// Per-sink queue capacity
pub const SINK_QUEUE_CAPACITY: usize = 1000;

/// One running sink: its inbox plus the consumer task
struct SinkHandle {
    name: &'static str,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    task: JoinHandle<()>,
}

/// The running exporter fan-out
pub struct Exporters {
    inbox: Arc<BoundedQueue<ReadingEvent>>,
    dispatcher: JoinHandle<()>,
    sinks: Vec<SinkHandle>,
}

impl Exporters {
    /// Register the dispatcher as a registry subscriber and spawn one
    /// consumer per enabled sink.
    pub fn start(registry: &Registry, config: &ExportConfig, stop: watch::Receiver<bool>) -> Self {
        let inbox = registry.subscribe("exporter", DISPATCHER_CAPACITY);

        let mut sinks = Vec::new();
        if config.http.enabled {
            let queue = Arc::new(BoundedQueue::new(SINK_QUEUE_CAPACITY));
            let task = http::spawn(config.http.clone(), queue.clone(), stop.clone());
            sinks.push(SinkHandle { name: "http", queue, task });
        }
        if config.database.enabled {
            let queue = Arc::new(BoundedQueue::new(SINK_QUEUE_CAPACITY));
            let task = database::spawn(config.database.clone(), queue.clone(), stop.clone());
            sinks.push(SinkHandle { name: "database", queue, task });
        }
        if config.mqtt.enabled {
            let queue = Arc::new(BoundedQueue::new(SINK_QUEUE_CAPACITY));
            let task = mqtt::spawn(config.mqtt.clone(), queue.clone(), stop.clone());
            sinks.push(SinkHandle { name: "mqtt", queue, task });
        }

        tracing::info!(
            sinks = sinks.len(),
            http = config.http.enabled,
            database = config.database.enabled,
            mqtt = config.mqtt.enabled,
            "Exporter fan-out started"
        );

        let sink_queues: Vec<Arc<BoundedQueue<ReadingEvent>>> =
            sinks.iter().map(|s| s.queue.clone()).collect();
        let dispatcher = tokio::spawn(run_dispatcher(inbox.clone(), sink_queues, stop));

        Self { inbox, dispatcher, sinks }
    }

    /// Readings dropped by the dispatcher inbox at capacity
    pub fn drops_total(&self) -> u64 {
        self.inbox.dropped_total()
    }

    /// Await dispatcher and sink tasks after the stop signal has fired.
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            tracing::warn!(error = %e, "Dispatcher task join failed");
        }
        for sink in self.sinks {
            if let Err(e) = sink.task.await {
                tracing::warn!(sink = sink.name, error = %e, "Sink task join failed");
            }
        }
    }
}

async fn run_dispatcher(
    inbox: Arc<BoundedQueue<ReadingEvent>>,
    sinks: Vec<Arc<BoundedQueue<ReadingEvent>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = inbox.pop() => forward(&event, &sinks),
            _ = stop.changed() => {
                while let Some(event) = inbox.try_pop() {
                    forward(&event, &sinks);
                }
                break;
            }
        }
    }
    tracing::info!("Dispatcher stopped");
}

/// Hand one event to every sink queue, preserving per-source order.
fn forward(event: &ReadingEvent, sinks: &[Arc<BoundedQueue<ReadingEvent>>]) {
    for sink in sinks {
        if !sink.push(event.clone()) {
            tracing::debug!(
                camera_id = %event.camera_id(),
                "Sink queue overflow, oldest reading dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;
    use chrono::Utc;

    fn event(meter: &str) -> ReadingEvent {
        ReadingEvent::Meter(Reading {
            camera_id: "cam-01".to_string(),
            meter_id: meter.to_string(),
            value: Some(1.0),
            raw_text: "1".to_string(),
            unit: String::new(),
            confidence: 1.0,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn forward_reaches_every_sink_in_order() {
        let a = Arc::new(BoundedQueue::new(8));
        let b = Arc::new(BoundedQueue::new(8));
        let sinks = vec![a.clone(), b.clone()];

        forward(&event("m1"), &sinks);
        forward(&event("m2"), &sinks);

        for queue in [&a, &b] {
            assert_eq!(queue.try_pop().unwrap().source_id(), "m1");
            assert_eq!(queue.try_pop().unwrap().source_id(), "m2");
        }
    }

    #[test]
    fn one_full_sink_does_not_affect_another() {
        let small = Arc::new(BoundedQueue::new(1));
        let large = Arc::new(BoundedQueue::new(8));
        let sinks = vec![small.clone(), large.clone()];

        forward(&event("m1"), &sinks);
        forward(&event("m2"), &sinks);

        // The small sink dropped its oldest, the large one kept both
        assert_eq!(small.len(), 1);
        assert_eq!(small.dropped_total(), 1);
        assert_eq!(large.len(), 2);
        assert_eq!(large.dropped_total(), 0);
    }
}
