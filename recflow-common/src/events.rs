//! Pipeline event types and the broadcast EventBus
//!
//! The engine publishes one event per committed step so observers (SSE
//! bridges, audit logs, tests) can follow pipeline progress without
//! polling storage. Publishing never blocks a pipeline: slow subscribers
//! lag and lose old events instead of applying backpressure.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Which pipeline produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    EntityWrite,
    RelationWrite,
}

/// Pipeline progress events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Entity data and freshly extracted features were persisted
    EntityCommitted {
        run_id: Uuid,
        entity_type: String,
        entity_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Generic classification was persisted onto the entity
    EntityClassified {
        run_id: Uuid,
        entity_type: String,
        entity_id: String,
        /// Classifier labels in registration order
        labels: Vec<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A relation write was persisted
    RelationCommitted {
        run_id: Uuid,
        entity_type: String,
        entity_id: String,
        user_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// User features and the user-entity score were persisted
    ///
    /// Emitted both for direct relation writes and for entity fan-out.
    UserUpdated {
        run_id: Uuid,
        entity_type: String,
        entity_id: String,
        user_id: String,
        score: f64,
        /// True when triggered by an entity write rather than a relation write
        fan_out: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A pipeline run aborted
    PipelineFailed {
        run_id: Uuid,
        kind: PipelineKind,
        entity_type: String,
        /// Serialization key the run was holding
        key: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PipelineEvent {
    /// Run identifier shared by all events of one pipeline execution
    pub fn run_id(&self) -> Uuid {
        match self {
            PipelineEvent::EntityCommitted { run_id, .. }
            | PipelineEvent::EntityClassified { run_id, .. }
            | PipelineEvent::RelationCommitted { run_id, .. }
            | PipelineEvent::UserUpdated { run_id, .. }
            | PipelineEvent::PipelineFailed { run_id, .. } => *run_id,
        }
    }
}

/// Central event distribution bus
///
/// Uses `tokio::sync::broadcast` internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use recflow_common::events::{EventBus, PipelineEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(PipelineEvent::EntityCommitted {
///     run_id: uuid::Uuid::new_v4(),
///     entity_type: "song".to_string(),
///     entity_id: "s1".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(entity_id: &str) -> PipelineEvent {
        PipelineEvent::EntityCommitted {
            run_id: Uuid::new_v4(),
            entity_type: "song".to_string(),
            entity_id: entity_id.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_fails() {
        let bus = EventBus::new(10);
        assert!(bus.emit(committed("s1")).is_err());
        // Lossy variant must not panic
        bus.emit_lossy(committed("s1"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(committed("a")).unwrap();
        bus.emit(committed("b")).unwrap();

        for expected in ["a", "b"] {
            match rx.recv().await.unwrap() {
                PipelineEvent::EntityCommitted { entity_id, .. } => assert_eq!(entity_id, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(committed("s1")).unwrap();
        assert_eq!(json["type"], "EntityCommitted");
        assert_eq!(json["entity_id"], "s1");
    }
}
