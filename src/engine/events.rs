// Event bus for execution events

//! # Event System
//!
//! Trees buffer their [`ExecutionEvent`]s while a command runs; the runtime
//! drains them afterwards and publishes them here. Subscribers receive every
//! event published after they subscribed, in publication order. A subscriber
//! that falls more than `capacity` events behind loses the oldest ones
//! (`RecvError::Lagged`), which never blocks publishers.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::ExecutionEvent;

pub const DEFAULT_EVENT_BUFFER: usize = 1000;

/// Broadcast bus for execution events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish one event; returns how many subscribers received it
    pub fn publish(&self, event: ExecutionEvent) -> usize {
        trace!(event = ?event.event_type, execution = %event.execution_id, "publishing event");
        // no subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    /// Publish a command's events in the order they were recorded
    pub fn publish_all(&self, events: Vec<ExecutionEvent>) -> usize {
        let count = events.len();
        for event in events {
            self.publish(event);
        }
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
