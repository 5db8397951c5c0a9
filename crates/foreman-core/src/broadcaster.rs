//! Event fan-out: one bounded channel per subscriber, optionally
//! scoped to a single project.
//!
//! Delivery is best-effort. A subscriber that falls behind loses events
//! rather than slowing down the rest of the system; a subscriber whose
//! receiver has been dropped is pruned on the next publish.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::event::Event;

/// Channel capacity for each subscriber. Chosen generously relative to the
/// expected burst size of a single agent's log lines between broadcaster
/// ticks; a subscriber that can't keep up with this is considered too slow
/// to matter and starts dropping events instead of backpressuring senders.
const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    project_scope: Option<String>,
    tx: mpsc::Sender<Event>,
}

/// Fans lifecycle events out to subscribers, each optionally scoped to a
/// single project. Cheap to clone; the subscriber list is shared.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event regardless of project.
    pub fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        self.subscribe(None)
    }

    /// Subscribe to events scoped to `project_id` plus project-less events
    /// (heartbeat ticks, ping/pong, the system heartbeat).
    pub fn subscribe_project(&self, project_id: &str) -> mpsc::Receiver<Event> {
        self.subscribe(Some(project_id.to_string()))
    }

    fn subscribe(&self, project_scope: Option<String>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().unwrap().push(Subscriber { project_scope, tx });
        rx
    }

    /// Current subscriber count. Exposed for tests and the `status` CLI
    /// command's diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Publish `event` to every matching, still-live subscriber.
    ///
    /// A subscriber whose scope doesn't match `event.project_id()` (and the
    /// event does carry a project) is skipped entirely. A matching
    /// subscriber that can't accept the event right now (full buffer) drops
    /// it; one whose receiver has been dropped is removed from the list.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain_mut(|sub| {
            if !scope_matches(sub.project_scope.as_deref(), event.project_id()) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("broadcaster: subscriber buffer full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("broadcaster: pruning closed subscriber");
                    false
                }
            }
        });
    }
}

fn scope_matches(subscriber_scope: Option<&str>, event_project: Option<&str>) -> bool {
    match subscriber_scope {
        None => true,
        Some(scope) => match event_project {
            Some(project) => project == scope,
            None => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_log(project: &str) -> Event {
        Event::AgentLog {
            card_id: "c1".into(),
            project_id: project.into(),
            agent: "claude".into(),
            line: "building...".into(),
        }
    }

    #[tokio::test]
    async fn unscoped_subscriber_receives_every_event() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe_all();
        b.publish(agent_log("p1"));
        b.publish(Event::HeartbeatTick { tick: 1, agents: 0 });

        assert!(matches!(rx.recv().await, Some(Event::AgentLog { .. })));
        assert!(matches!(rx.recv().await, Some(Event::HeartbeatTick { .. })));
    }

    #[tokio::test]
    async fn project_scoped_subscriber_only_sees_its_project() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe_project("p1");
        b.publish(agent_log("p2"));
        b.publish(agent_log("p1"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.project_id(), Some("p1"));
    }

    #[tokio::test]
    async fn project_scoped_subscriber_still_sees_project_less_events() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe_project("p1");
        b.publish(Event::HeartbeatTick { tick: 1, agents: 0 });

        assert!(matches!(rx.recv().await, Some(Event::HeartbeatTick { .. })));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let b = Broadcaster::new();
        let rx = b.subscribe_all();
        drop(rx);
        assert_eq!(b.subscriber_count(), 1);

        b.publish(Event::HeartbeatIdle);
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_buffer_drops_event_without_panicking() {
        let b = Broadcaster::new();
        let mut rx = b.subscribe_all();
        for _ in 0..(SUBSCRIBER_CAPACITY + 10) {
            b.publish(Event::HeartbeatIdle);
        }
        // Still alive and able to drain at least the buffered capacity.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= SUBSCRIBER_CAPACITY);
    }
}
