//! $SYS Topics Publisher
//!
//! Publishes broker statistics as retained messages to standard $SYS/# topics.
//! Topics are updated periodically based on configuration.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use super::PublishHandle;
use crate::metrics::Metrics;
use crate::protocol::QoS;

/// Version string for $SYS/broker/version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Publish all $SYS topics as retained messages
fn publish_sys_topics(handle: &PublishHandle, metrics: Option<&Metrics>, start_time: Instant) {
    let uptime = start_time.elapsed().as_secs();

    publish(handle, "$SYS/broker/version", VERSION);
    publish(handle, "$SYS/broker/uptime", &uptime.to_string());

    if let Some(metrics) = metrics {
        publish(
            handle,
            "$SYS/broker/clients/connected",
            &metrics.connections_current.get().to_string(),
        );
        publish(
            handle,
            "$SYS/broker/clients/total",
            &metrics.connections_total.get().to_string(),
        );
        publish(
            handle,
            "$SYS/broker/subscriptions/count",
            &metrics.subscriptions_current.get().to_string(),
        );
        publish(
            handle,
            "$SYS/broker/retained messages/count",
            &metrics.retained_messages_current.get().to_string(),
        );
        publish(
            handle,
            "$SYS/broker/bytes/received",
            &metrics.messages_bytes_received.get().to_string(),
        );
        publish(
            handle,
            "$SYS/broker/bytes/sent",
            &metrics.messages_bytes_sent.get().to_string(),
        );
    }
}

/// Helper to publish a single $SYS topic as QoS 0 retained
fn publish(handle: &PublishHandle, topic: &str, value: &str) {
    handle.publish(
        topic.to_string(),
        Bytes::from(value.to_string()),
        QoS::AtMostOnce,
        true,
    );
}

/// Spawn the $SYS topics publishing task
pub fn spawn_sys_topics_task(
    handle: PublishHandle,
    metrics: Option<Arc<Metrics>>,
    interval_secs: u64,
    start_time: Instant,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));

        publish_sys_topics(&handle, metrics.as_deref(), start_time);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    publish_sys_topics(&handle, metrics.as_deref(), start_time);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("$SYS topics task shutting down");
                    break;
                }
            }
        }
    });
}
