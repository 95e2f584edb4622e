//! Event system for real-time state notifications
//!
//! This module provides a process-wide event bus for broadcasting state
//! changes to WebSocket clients and other subscribers. Per-publisher order
//! is preserved by the broadcast channel; order across publishers is not.

pub mod types;

pub use types::{ComponentError, SystemEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Process-wide event bus
///
/// Built on tokio's broadcast channel. A subscriber that falls more than
/// [`EVENT_CHANNEL_CAPACITY`] events behind receives `Lagged` and is expected
/// to drop out; the bus never blocks a publisher.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped;
    /// events are fire-and-forget notifications.
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

    fn camera_event(id: &str) -> SystemEvent {
        SystemEvent::Camera {
            camera_id: id.to_string(),
            status: "streaming".to_string(),
            has_signal: true,
            actual_resolution: Some("1920x1080".to_string()),
            restart_count: 0,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(camera_event("cam0"));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::Camera { .. }));
        assert_eq!(event.topic(), "camera");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::Disk {
            free_gb: 42.0,
            low: false,
        });

        assert!(matches!(rx1.recv().await.unwrap(), SystemEvent::Disk { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SystemEvent::Disk { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Must not panic when publishing with no subscribers
        bus.publish(camera_event("cam0"));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(camera_event("cam0")).unwrap();
        assert_eq!(json["topic"], "camera");
        assert_eq!(json["payload"]["camera_id"], "cam0");
    }
}
