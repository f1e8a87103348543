//! Normalized-event work queue.
//!
//! The webhook receiver pushes normalized records onto an in-process
//! ordered queue; a delivery worker drains it and flips the stored events
//! to DELIVERED. Enqueue failure leaves the event PENDING for the
//! background redelivery loop.

use crate::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use toolgate_core::store::CatalogStore;
use tracing::{info, warn};
use uuid::Uuid;

/// The record handed to downstream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedEvent {
    pub provider: String,
    pub event_type: String,
    /// The trigger the event belongs to.
    pub subject_id: Uuid,
    /// The stored TriggerEvent row.
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
#[error("event queue is closed")]
pub struct EnqueueError;

/// Sending half of the queue, shared across handlers.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<NormalizedEvent>,
}

impl EventQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NormalizedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, event: NormalizedEvent) -> Result<(), EnqueueError> {
        self.tx.send(event).map_err(|_| EnqueueError)
    }
}

/// Drain the queue, marking each stored event DELIVERED. Runs for the
/// lifetime of the process.
pub fn spawn_delivery_worker(
    store: Arc<CatalogStore>,
    metrics: Arc<MetricsCollector>,
    mut rx: mpsc::UnboundedReceiver<NormalizedEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match store.mark_event_delivered(event.event_id) {
                Ok(()) => {
                    metrics.increment_counter(
                        "trigger_events_delivered",
                        1.0,
                        &[("provider", event.provider.as_str())],
                    );
                    info!(
                        event_id = %event.event_id,
                        trigger_id = %event.subject_id,
                        event_type = %event.event_type,
                        "delivered trigger event"
                    );
                }
                Err(e) => {
                    metrics.increment_counter(
                        "trigger_events_delivery_failed",
                        1.0,
                        &[("provider", event.provider.as_str())],
                    );
                    warn!(event_id = %event.event_id, error = %e, "failed to mark event delivered");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_id: Uuid) -> NormalizedEvent {
        NormalizedEvent {
            provider: "github".into(),
            event_type: "push".into(),
            subject_id: Uuid::new_v4(),
            event_id,
            timestamp: Utc::now(),
            data: json!({"ref": "refs/heads/main"}),
        }
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order() {
        let (queue, mut rx) = EventQueue::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.enqueue(event(*id)).unwrap();
        }
        for id in &ids {
            assert_eq!(rx.recv().await.unwrap().event_id, *id);
        }
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (queue, rx) = EventQueue::new();
        drop(rx);
        assert!(queue.enqueue(event(Uuid::new_v4())).is_err());
    }

    #[tokio::test]
    async fn test_delivery_worker_drains_and_exits() {
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        let metrics = Arc::new(MetricsCollector::new());
        let (queue, rx) = EventQueue::new();
        let handle = spawn_delivery_worker(store, metrics.clone(), rx);

        queue.enqueue(event(Uuid::new_v4())).unwrap();
        queue.enqueue(event(Uuid::new_v4())).unwrap();
        drop(queue);
        handle.await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.counters["trigger_events_delivered{provider=github}"],
            2.0
        );
    }
}
