//! Orchestration events.
//!
//! The scheduler publishes an [`OrchestrationEvent`] for every dispatch,
//! delegation decision and task outcome on a tokio broadcast channel.
//! Subscribers that fall behind lose the oldest events, never the run.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something that happened during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    SessionStarted {
        tasks: Vec<String>,
        policy: String,
    },
    /// The decision policy assigned `roles` to `task`. `fallback` is set
    /// when the scheduler replaced an unusable decision with the bound role.
    DecisionMade {
        task: String,
        roles: Vec<String>,
        policy: String,
        fallback: bool,
    },
    TaskDispatched {
        task: String,
        roles: Vec<String>,
        attempt: u32,
    },
    TaskSucceeded {
        task: String,
        agent: String,
        attempt: u32,
    },
    TaskFailed {
        task: String,
        attempt: u32,
        failures: u32,
        retryable: bool,
        reason: String,
    },
    HelpRequested {
        task: String,
        role: String,
        reason: String,
    },
    TaskSkipped {
        task: String,
    },
    SessionFinished {
        status: String,
        dispatches: u32,
    },
}

impl OrchestrationEvent {
    /// The task an event is about, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::DecisionMade { task, .. }
            | OrchestrationEvent::TaskDispatched { task, .. }
            | OrchestrationEvent::TaskSucceeded { task, .. }
            | OrchestrationEvent::TaskFailed { task, .. }
            | OrchestrationEvent::HelpRequested { task, .. }
            | OrchestrationEvent::TaskSkipped { task } => Some(task),
            OrchestrationEvent::SessionStarted { .. } | OrchestrationEvent::SessionFinished { .. } => None,
        }
    }
}

/// Broadcast channel for [`OrchestrationEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: OrchestrationEvent) {
        log::trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(OrchestrationEvent::TaskSkipped { task: "a".into() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task(), Some("a"));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        EventBus::new(4).publish(OrchestrationEvent::SessionFinished {
            status: "completed".into(),
            dispatches: 3,
        });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OrchestrationEvent::TaskDispatched {
            task: "hpt_criteria_task".into(),
            roles: vec!["target_strategist".into()],
            attempt: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "task_dispatched");
        assert_eq!(json["data"]["attempt"], 2);
    }
}
