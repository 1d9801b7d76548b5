//! MQTT sink
//!
//! Publishes one JSON message per reading. The topic comes from
//! `topic_template` with `{camera_id}` and `{meter_id}` / `{indicator_id}`
//! substituted. While the broker is unreachable the bounded pending queue
//! (drop-oldest, capacity 1000) absorbs readings; the rumqttc event loop
//! reconnects and our poll task backs off exponentially between failures.

use crate::config::MqttExportConfig;
use crate::export::queue::BoundedQueue;
use crate::models::ReadingEvent;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Publish enqueue timeout
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnect backoff cap
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Substitute event identifiers into the topic template.
pub fn topic_for(template: &str, event: &ReadingEvent) -> String {
    template
        .replace("{camera_id}", event.camera_id())
        .replace("{meter_id}", event.source_id())
        .replace("{indicator_id}", event.source_id())
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub fn spawn(
    config: MqttExportConfig,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(config, queue, stop))
}

async fn run(
    config: MqttExportConfig,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    mut stop: watch::Receiver<bool>,
) {
    let client_id = format!("ctme-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }

    let (client, mut event_loop) = AsyncClient::new(options, 64);
    let qos = qos_level(config.qos);

    tracing::info!(
        broker = %config.broker,
        port = config.port,
        topic_template = %config.topic_template,
        "MQTT sink started"
    );

    // Connection poller: rumqttc reconnects on the next poll after an error;
    // back off between failures so an absent broker is not hammered.
    let mut poll_stop = stop.clone();
    let poller = tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        failures = 0;
                        tracing::info!("MQTT connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = Duration::from_secs(1u64 << failures.min(5)).min(RECONNECT_CAP);
                        failures = failures.saturating_add(1);
                        tracing::warn!(error = %e, delay_sec = delay.as_secs(), "MQTT connection error, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = poll_stop.changed() => break,
                        }
                    }
                },
                _ = poll_stop.changed() => break,
            }
        }
    });

    loop {
        tokio::select! {
            event = queue.pop() => {
                publish(&client, &config.topic_template, qos, &event).await;
            }
            _ = stop.changed() => {
                while let Some(event) = queue.try_pop() {
                    publish(&client, &config.topic_template, qos, &event).await;
                }
                break;
            }
        }
    }

    let _ = client.disconnect().await;
    let _ = poller.await;
    tracing::info!("MQTT sink stopped");
}

async fn publish(client: &AsyncClient, template: &str, qos: QoS, event: &ReadingEvent) {
    let topic = topic_for(template, event);
    let payload = match serde_json::to_vec(event) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "MQTT sink failed to serialize reading");
            return;
        }
    };

    match tokio::time::timeout(PUBLISH_TIMEOUT, client.publish(&topic, qos, false, payload)).await {
        Ok(Ok(())) => {
            tracing::trace!(topic = %topic, "MQTT reading published");
        }
        Ok(Err(e)) => {
            tracing::warn!(topic = %topic, error = %e, "MQTT publish failed");
        }
        Err(_) => {
            tracing::warn!(topic = %topic, "MQTT publish timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndicatorReading, Reading};
    use chrono::Utc;

    #[test]
    fn topic_substitution_for_meters() {
        let event = ReadingEvent::Meter(Reading {
            camera_id: "cam-01".to_string(),
            meter_id: "meter-01".to_string(),
            value: Some(1.0),
            raw_text: "1".to_string(),
            unit: String::new(),
            confidence: 1.0,
            timestamp: Utc::now(),
        });
        assert_eq!(
            topic_for("ctme/{camera_id}/{meter_id}", &event),
            "ctme/cam-01/meter-01"
        );
    }

    #[test]
    fn topic_substitution_for_indicators() {
        let event = ReadingEvent::Indicator(IndicatorReading {
            camera_id: "cam-01".to_string(),
            indicator_id: "fire-west".to_string(),
            state: true,
            score: 182.4,
            timestamp: Utc::now(),
        });
        assert_eq!(
            topic_for("ctme/{camera_id}/{indicator_id}", &event),
            "ctme/cam-01/fire-west"
        );
    }

    #[test]
    fn static_template_is_left_alone() {
        let event = ReadingEvent::Indicator(IndicatorReading {
            camera_id: "cam-01".to_string(),
            indicator_id: "i1".to_string(),
            state: false,
            score: 0.0,
            timestamp: Utc::now(),
        });
        assert_eq!(topic_for("ctme/readings", &event), "ctme/readings");
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
    }
}
