//! # Event Bus
//!
//! Broadcast channel carrying runtime notifications. Asynchronous dispatch
//! never surfaces failures to the firing caller, so subscribers of this bus
//! (and operation status records) are how those failures are observed.
//!
//! Publishing never blocks. Slow subscribers lag and lose the oldest events
//! rather than stalling dispatch.

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::eval::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    RegistryReloaded { version: u64 },
    OperationStarted { uuid: Uuid },
    OperationCompleted { uuid: Uuid },
    OperationCancelled { uuid: Uuid },
    OperationFailed { uuid: Uuid },
    HandlerFailed { handler: String },
    JobMissing { name: String },
    JobSkipped { name: String },
    JobSuperseded { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub parameters: IndexMap<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            parameters: IndexMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("failed to send event: {message}")]
    SendFailed { message: String },
    #[error("event receiver lagged by {count} events")]
    Lagged { count: u64 },
    #[error("event bus closed")]
    Closed,
}

pub type EventResult<T> = Result<T, EventError>;

pub struct EventReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> EventResult<Event> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(count) => EventError::Lagged { count },
            broadcast::error::RecvError::Closed => EventError::Closed,
        })
    }

    /// Non-blocking variant; `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    capacity: usize,
    /// Keeps the channel open with no external subscribers.
    _internal_receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            _internal_receiver: receiver,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: Event) -> EventResult<()> {
        trace!(event = ?event.event_type, "publishing");
        self.sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        for _ in 0..10 {
            bus.publish(Event::new(EventType::JobMissing { name: "x".into() }))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventType::JobSkipped { name: "a".into() }).with_parameter("n", 1i64))
            .unwrap();
        bus.publish(Event::new(EventType::JobSkipped { name: "b".into() }))
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::JobSkipped { name: "a".into() });
        assert_eq!(first.parameters.get("n"), Some(&Value::Integer(1)));
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            EventType::JobSkipped { name: "b".into() }
        );
        assert!(rx.try_recv().is_none());
    }
}
