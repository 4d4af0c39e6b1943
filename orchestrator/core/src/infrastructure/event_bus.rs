// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Deployment Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Lets callers observe deployment status changes instead of polling.
//
// Events are not persisted; a subscriber only sees events published after it
// subscribed.

use crate::domain::deployment::DeploymentId;
use crate::domain::events::DeploymentEvent;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to deployment events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DeploymentEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish a deployment event to all subscribers
    pub fn publish(&self, event: DeploymentEvent) {
        debug!(event = event.name(), deployment_id = %event.deployment_id(), "Publishing event");

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Publish events in order
    pub fn publish_all(&self, events: impl IntoIterator<Item = DeploymentEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to all deployment events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe and filter for a single deployment
    pub fn subscribe_deployment(&self, deployment_id: DeploymentId) -> DeploymentEventReceiver {
        let receiver = self.sender.subscribe();
        DeploymentEventReceiver {
            receiver,
            deployment_id,
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all deployment events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DeploymentEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until an event is available)
    pub async fn recv(&mut self) -> Result<DeploymentEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DeploymentEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for events of one deployment (filtered)
pub struct DeploymentEventReceiver {
    receiver: broadcast::Receiver<DeploymentEvent>,
    deployment_id: DeploymentId,
}

impl DeploymentEventReceiver {
    /// Receive the next event for the subscribed deployment, skipping others
    pub async fn recv(&mut self) -> Result<DeploymentEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.deployment_id() == self.deployment_id {
                return Ok(event);
            }
        }
    }

    /// Events of the subscribed deployment as a stream. Lagging skips the
    /// dropped events; the stream ends when the bus is dropped.
    pub fn into_stream(self) -> impl Stream<Item = DeploymentEvent> + Send {
        futures::stream::unfold(self, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        })
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stopped(deployment_id: DeploymentId) -> DeploymentEvent {
        DeploymentEvent::DeploymentStopped {
            deployment_id,
            stopped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();
        let deployment_id = DeploymentId::new();

        event_bus.publish(stopped(deployment_id));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.deployment_id(), deployment_id);
        assert_eq!(received.name(), "deployment_stopped");
    }

    #[tokio::test]
    async fn test_deployment_event_filtering() {
        let event_bus = EventBus::new(10);
        let deployment_id = DeploymentId::new();
        let mut receiver = event_bus.subscribe_deployment(deployment_id);

        event_bus.publish_all([stopped(DeploymentId::new()), stopped(deployment_id)]);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.deployment_id(), deployment_id);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let event_bus = EventBus::default();
        event_bus.publish(stopped(DeploymentId::new()));

        let mut late = event_bus.subscribe();
        assert!(matches!(late.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_deployment_stream_ends_with_bus() {
        use futures::StreamExt;

        let deployment_id = DeploymentId::new();
        let event_bus = EventBus::new(10);
        let stream = event_bus.subscribe_deployment(deployment_id).into_stream();

        event_bus.publish_all([
            stopped(deployment_id),
            stopped(DeploymentId::new()),
            stopped(deployment_id),
        ]);
        drop(event_bus);

        let events: Vec<DeploymentEvent> = tokio_test::block_on(stream.collect());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.deployment_id() == deployment_id));
    }

    #[tokio::test]
    async fn test_lagged_receiver() {
        let event_bus = EventBus::new(1);
        let mut receiver = event_bus.subscribe();
        event_bus.publish_all([stopped(DeploymentId::new()), stopped(DeploymentId::new())]);

        assert!(matches!(receiver.try_recv(), Err(EventBusError::Lagged(1))));
        assert!(receiver.try_recv().is_ok());
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
