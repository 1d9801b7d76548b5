//! HTTP sink
//!
//! Batches readings and POSTs them as a JSON array. A batch closes when it
//! reaches `batch_size` or when `interval_seconds` have passed since its
//! first item. Transient failures (5xx, network) retry the same batch with
//! exponential backoff; client errors (4xx) drop the batch.

use crate::config::HttpExportConfig;
use crate::export::queue::BoundedQueue;
use crate::models::ReadingEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Retry backoff schedule in seconds, capped at the last entry
const RETRY_DELAYS: [u64; 6] = [1, 2, 4, 8, 16, 60];

pub fn spawn(
    config: HttpExportConfig,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(config, queue, stop))
}

async fn run(
    config: HttpExportConfig,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    mut stop: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(config.timeout_seconds))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "HTTP sink failed to build client");
            return;
        }
    };

    tracing::info!(url = %config.url, batch_size = config.batch_size, "HTTP sink started");

    let mut batch: Vec<ReadingEvent> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        // The stop notification may already have been consumed by a retry
        // loop; the flag itself is authoritative
        if *stop.borrow() {
            if !batch.is_empty() {
                let _ = post_once(&client, &config, &batch).await;
            }
            break;
        }

        let flush_now = tokio::select! {
            event = queue.pop() => {
                if batch.is_empty() {
                    deadline = Some(Instant::now() + Duration::from_secs_f64(config.interval_seconds));
                }
                batch.push(event);
                batch.len() >= config.batch_size.max(1)
            }
            _ = sleep_until_deadline(deadline), if deadline.is_some() => true,
            _ = stop.changed() => {
                // Final flush, single attempt
                if !batch.is_empty() {
                    let _ = post_once(&client, &config, &batch).await;
                }
                break;
            }
        };

        if flush_now && !batch.is_empty() {
            post_with_retry(&client, &config, &batch, &mut stop).await;
            batch.clear();
            deadline = None;
        }
    }

    tracing::info!("HTTP sink stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// POST the batch, retrying transient failures until it goes through or the
/// stop signal fires. The batch is preserved across retries.
async fn post_with_retry(
    client: &reqwest::Client,
    config: &HttpExportConfig,
    batch: &[ReadingEvent],
    stop: &mut watch::Receiver<bool>,
) {
    let mut attempt = 0usize;
    loop {
        match post_once(client, config, batch).await {
            PostOutcome::Delivered => return,
            PostOutcome::Permanent => return,
            PostOutcome::Transient => {
                let delay = RETRY_DELAYS[attempt.min(RETRY_DELAYS.len() - 1)];
                attempt += 1;
                tracing::debug!(attempt = attempt, delay_sec = delay, "HTTP sink retrying batch");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = stop.changed() => return,
                }
            }
        }
    }
}

enum PostOutcome {
    Delivered,
    Transient,
    Permanent,
}

async fn post_once(
    client: &reqwest::Client,
    config: &HttpExportConfig,
    batch: &[ReadingEvent],
) -> PostOutcome {
    let mut request = client.post(&config.url).json(batch);
    for (key, value) in &config.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                tracing::debug!(count = batch.len(), "HTTP sink batch delivered");
                PostOutcome::Delivered
            } else if status.is_client_error() {
                tracing::warn!(
                    status = %status,
                    count = batch.len(),
                    "HTTP sink dropping batch on client error"
                );
                PostOutcome::Permanent
            } else {
                tracing::warn!(status = %status, "HTTP sink server error, will retry");
                PostOutcome::Transient
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "HTTP sink request failed, will retry");
            PostOutcome::Transient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;
    use chrono::Utc;

    #[test]
    fn batch_serializes_as_json_array() {
        let batch = vec![
            ReadingEvent::Meter(Reading {
                camera_id: "cam-01".to_string(),
                meter_id: "meter-01".to_string(),
                value: Some(12.34),
                raw_text: "1234".to_string(),
                unit: "kPa".to_string(),
                confidence: 0.95,
                timestamp: Utc::now(),
            }),
            ReadingEvent::Meter(Reading::failure("cam-01", "meter-02", "", Utc::now())),
        ];

        let json = serde_json::to_value(&batch).unwrap();
        let array = json.as_array().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["meter_id"], "meter-01");
        // Failure readings are exported too, with null value
        assert!(array[1]["value"].is_null());
        assert_eq!(array[1]["confidence"], 0.0);
    }
}
