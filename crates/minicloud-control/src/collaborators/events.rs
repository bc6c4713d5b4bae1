//! State-change events and user notifications.
//!
//! Both are best-effort: a failed publish or notification is logged and the
//! lifecycle carries on.

use chrono::{DateTime, Utc};
use minicloud_core::InstanceId;
use minicloud_store::{InstanceEvent, InstanceRecord, InstanceState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Emitted on every instance state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStateChanged {
    /// Event source, always [`InstanceStateChanged::SOURCE`].
    pub source: String,
    /// Event type, always [`InstanceStateChanged::DETAIL_TYPE`].
    pub detail_type: String,
    /// The instance.
    pub instance_id: InstanceId,
    /// Owning project.
    pub project_id: String,
    /// State before the transition; `None` when the instance was created.
    pub from_state: Option<InstanceState>,
    /// State after the transition.
    pub to_state: InstanceState,
    /// Free-form description.
    pub message: String,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
}

impl InstanceStateChanged {
    /// Source name downstream routers match on.
    pub const SOURCE: &'static str = "minicloud.compute";
    /// Detail type downstream routers match on.
    pub const DETAIL_TYPE: &'static str = "InstanceStateChanged";

    /// Build the event for a transition just written to the audit log.
    #[must_use]
    pub fn from_transition(record: &InstanceRecord, event: &InstanceEvent) -> Self {
        Self {
            source: Self::SOURCE.to_string(),
            detail_type: Self::DETAIL_TYPE.to_string(),
            instance_id: record.id,
            project_id: record.spec.project_id.clone(),
            from_state: event.from_state,
            to_state: event.to_state,
            message: event.message.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// Receives state-change events, e.g. an event router.
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block.
    fn publish(&self, event: &InstanceStateChanged);
}

/// Fans events out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<InstanceStateChanged>,
}

impl BroadcastEventSink {
    /// Create a sink buffering up to `capacity` events per slow subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceStateChanged> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: &InstanceStateChanged) {
        // No subscribers is fine.
        if self.sender.send(event.clone()).is_err() {
            debug!(instance_id = %event.instance_id, "No event subscribers");
        }
    }
}

/// Delivers user-facing notifications.
pub trait Notifier: Send + Sync {
    /// Send `message` about `instance_id` on `channel`.
    fn notify(&self, channel: &str, instance_id: &InstanceId, message: &str);
}

/// Notifier that writes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, channel: &str, instance_id: &InstanceId, message: &str) {
        info!(channel, %instance_id, text = message, "Notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicloud_store::InstanceSpec;

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe();

        let record = InstanceRecord::new(
            InstanceId::generate(),
            InstanceSpec {
                project_id: "proj-1".to_string(),
                ..InstanceSpec::default()
            },
        );
        let event = InstanceEvent {
            instance_id: record.id,
            seq: 1,
            from_state: None,
            to_state: InstanceState::Requested,
            message: "Instance requested".to_string(),
            timestamp: record.created_at,
        };
        sink.publish(&InstanceStateChanged::from_transition(&record, &event));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.source, "minicloud.compute");
        assert_eq!(received.detail_type, "InstanceStateChanged");
        assert_eq!(received.project_id, "proj-1");
        assert_eq!(received.to_state, InstanceState::Requested);
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let sink = BroadcastEventSink::new(4);
        let record = InstanceRecord::new(InstanceId::generate(), InstanceSpec::default());
        let event = InstanceEvent {
            instance_id: record.id,
            seq: 1,
            from_state: None,
            to_state: InstanceState::Requested,
            message: String::new(),
            timestamp: record.created_at,
        };
        sink.publish(&InstanceStateChanged::from_transition(&record, &event));
    }
}
