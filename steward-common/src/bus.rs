//! Notification bus for cross-engine triggering.
//!
//! Engines publish lifecycle events to typed topics; the controller registers
//! handlers at startup. Delivery is best-effort and fire-and-forget: publishing
//! to a topic with no subscribers succeeds, and ordering across subscribers is
//! not guaranteed.
//!
//! # Topics
//!
//! | Topic | Published by |
//! |-------|--------------|
//! | `task:scheduled` / `task:started` / `task:completed` / `task:failed` / `task:skipped` / `task:removed` | scheduler |
//! | `execution:started` / `execution:completed` / `execution:failed` / `execution:stopped` | workflow engine |
//! | `decision:made` | decision matrix |
//! | `controller:health` | controller |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Event bus errors.
#[derive(Error, Debug)]
pub enum BusError {
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

// ============================================================================
// Topics
// ============================================================================

/// Typed event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "task:scheduled")]
    TaskScheduled,
    #[serde(rename = "task:started")]
    TaskStarted,
    #[serde(rename = "task:completed")]
    TaskCompleted,
    #[serde(rename = "task:failed")]
    TaskFailed,
    #[serde(rename = "task:skipped")]
    TaskSkipped,
    #[serde(rename = "task:removed")]
    TaskRemoved,
    #[serde(rename = "execution:started")]
    ExecutionStarted,
    #[serde(rename = "execution:completed")]
    ExecutionCompleted,
    #[serde(rename = "execution:failed")]
    ExecutionFailed,
    #[serde(rename = "execution:stopped")]
    ExecutionStopped,
    #[serde(rename = "decision:made")]
    DecisionMade,
    #[serde(rename = "controller:health")]
    ControllerHealth,
}

impl Topic {
    /// Wire name of the topic.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Topic::TaskScheduled => "task:scheduled",
            Topic::TaskStarted => "task:started",
            Topic::TaskCompleted => "task:completed",
            Topic::TaskFailed => "task:failed",
            Topic::TaskSkipped => "task:skipped",
            Topic::TaskRemoved => "task:removed",
            Topic::ExecutionStarted => "execution:started",
            Topic::ExecutionCompleted => "execution:completed",
            Topic::ExecutionFailed => "execution:failed",
            Topic::ExecutionStopped => "execution:stopped",
            Topic::DecisionMade => "decision:made",
            Topic::ControllerHealth => "controller:health",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Event envelope published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    /// Topic the event was published to.
    pub topic: Topic,
    /// Source component (e.g., "scheduler", "workflow").
    pub source: String,
    /// Correlation ID (task, execution or decision id).
    pub correlation_id: Option<String>,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// JSON payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event with auto-generated ID and timestamp.
    pub fn new(topic: Topic, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic,
            source: source.into(),
            correlation_id: None,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Serialize) -> BusResult<Self> {
        self.payload =
            serde_json::to_value(payload).map_err(|e| BusError::Serialization(e.to_string()))?;
        Ok(self)
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

// ============================================================================
// Event Bus Trait
// ============================================================================

/// Trait for event bus implementations.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to its topic.
    async fn publish(&self, event: Event) -> BusResult<()>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: Topic) -> BusResult<EventReceiver>;

    /// Check if the bus is healthy.
    async fn is_healthy(&self) -> bool;

    /// Close the bus, dropping all topic senders.
    async fn close(&self) -> BusResult<()>;
}

/// Event receiver for subscriptions.
pub struct EventReceiver {
    inner: broadcast::Receiver<Event>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Events missed by a lagging receiver are skipped. Returns `None` once
    /// the topic has been closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Event receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Publish an event, logging instead of failing.
///
/// Engines use this so that bus trouble never interrupts orchestration.
pub async fn publish_best_effort(bus: &dyn EventBus, event: BusResult<Event>) {
    let result = match event {
        Ok(event) => bus.publish(event).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to publish event");
    }
}

/// Spawn a handler that runs for every event published on `topic`.
///
/// The subscription is established before this function returns, so events
/// published afterwards are never missed.
pub async fn spawn_handler<F, Fut>(
    bus: Arc<dyn EventBus>,
    topic: Topic,
    handler: F,
) -> BusResult<JoinHandle<()>>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut receiver = bus.subscribe(topic).await?;

    Ok(tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            handler(event).await;
        }
        tracing::debug!(topic = %topic, "Event handler stopped");
    }))
}

// ============================================================================
// In-Memory Event Bus
// ============================================================================

/// In-memory event bus backed by tokio broadcast channels.
pub struct InMemoryBus {
    /// Topic -> broadcast sender.
    topics: Arc<RwLock<HashMap<Topic, broadcast::Sender<Event>>>>,
    /// Channel capacity.
    capacity: usize,
}

impl InMemoryBus {
    /// Create a new in-memory bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new in-memory bus with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Get or create a topic sender.
    async fn get_or_create_topic(&self, topic: Topic) -> broadcast::Sender<Event> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: Event) -> BusResult<()> {
        let sender = {
            let topics = self.topics.read().await;
            topics.get(&event.topic).cloned()
        };

        tracing::debug!(
            topic = %event.topic,
            id = %event.id,
            "Event published"
        );

        // No sender means nobody ever subscribed; a send error means nobody is listening now.
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }

        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> BusResult<EventReceiver> {
        let sender = self.get_or_create_topic(topic).await;
        let receiver = sender.subscribe();

        tracing::debug!(topic = %topic, "Subscribed to topic");

        Ok(EventReceiver { inner: receiver })
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> BusResult<()> {
        let mut topics = self.topics.write().await;
        topics.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_topic_wire_names() {
        assert_eq!(Topic::ExecutionFailed.as_str(), "execution:failed");
        assert_eq!(
            serde_json::to_value(Topic::TaskCompleted).unwrap(),
            serde_json::json!("task:completed")
        );
        let parsed: Topic = serde_json::from_str("\"decision:made\"").unwrap();
        assert_eq!(parsed, Topic::DecisionMade);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InMemoryBus::new();
        let event = Event::new(Topic::TaskCompleted, "test");
        assert!(bus.publish(event).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_receives_only_its_topic() {
        let bus = InMemoryBus::new();
        let mut receiver = bus.subscribe(Topic::ExecutionFailed).await.unwrap();

        bus.publish(Event::new(Topic::ExecutionCompleted, "workflow"))
            .await
            .unwrap();
        let failed = Event::new(Topic::ExecutionFailed, "workflow")
            .with_correlation_id("exec-1")
            .with_payload(serde_json::json!({"error": "boom"}))
            .unwrap();
        bus.publish(failed).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.topic, Topic::ExecutionFailed);
        assert_eq!(received.correlation_id.as_deref(), Some("exec-1"));
        assert_eq!(received.payload["error"], "boom");
    }

    #[tokio::test]
    async fn test_spawn_handler_runs_for_each_event() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = counter.clone();
        let handle = spawn_handler(bus.clone(), Topic::TaskFailed, move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        for _ in 0..3 {
            bus.publish(Event::new(Topic::TaskFailed, "scheduler"))
                .await
                .unwrap();
        }

        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test]
    async fn test_close_ends_receivers() {
        let bus = InMemoryBus::new();
        let mut receiver = bus.subscribe(Topic::DecisionMade).await.unwrap();
        bus.close().await.unwrap();
        assert!(receiver.recv().await.is_none());
    }
}
