//! Broadcast channel for real-time processing updates.
//!
//! The queue publishes an event for every branch status transition and for
//! each completed metadata extraction; WebSocket sessions subscribe and
//! forward the JSON payloads to connected clients. Slow subscribers drop
//! events rather than stall the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Branch, FileMetadata, ProcessingStatus};

const CHANNEL_CAPACITY: usize = 256;

/// One event pushed over `/ws`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingEvent {
    /// A branch changed status.
    FileProcessingUpdate {
        file_id: String,
        branch: Branch,
        status: ProcessingStatus,
        timestamp: DateTime<Utc>,
    },
    /// Metadata extraction finished and was persisted.
    MetadataExtracted {
        file_id: String,
        file_metadata: FileMetadata,
        timestamp: DateTime<Utc>,
    },
}

impl ProcessingEvent {
    pub fn status_update(file_id: &str, branch: Branch, status: ProcessingStatus) -> Self {
        ProcessingEvent::FileProcessingUpdate {
            file_id: file_id.to_string(),
            branch,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn metadata_extracted(file_id: &str, metadata: FileMetadata) -> Self {
        ProcessingEvent::MetadataExtracted {
            file_id: file_id.to_string(),
            file_metadata: metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out handle shared by the queue and the WebSocket layer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProcessingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Lagging or absent subscribers are
    /// not an error.
    pub fn publish(&self, event: ProcessingEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ProcessingEvent::status_update(
            "f1",
            Branch::Vector,
            ProcessingStatus::Processing,
        ));
        match rx.recv().await.unwrap() {
            ProcessingEvent::FileProcessingUpdate { file_id, branch, status, .. } => {
                assert_eq!(file_id, "f1");
                assert_eq!(branch, Branch::Vector);
                assert_eq!(status, ProcessingStatus::Processing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(ProcessingEvent::status_update(
            "f1",
            Branch::Metadata,
            ProcessingStatus::Completed,
        ));
    }

    #[test]
    fn test_event_serializes_with_snake_case_tag() {
        let ev = ProcessingEvent::status_update("f1", Branch::Vector, ProcessingStatus::Failed);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "file_processing_update");
        assert_eq!(json["branch"], "vector");
        assert_eq!(json["status"], "failed");
    }
}
