//! Change notifications for committed mutations
//!
//! A [`ChangeBus`] is created once at process start and handed to every
//! component that publishes or consumes change events; [`ChangeBus::close`]
//! tears it down at shutdown. Events carry only their scope, consumers
//! re-query for the new state.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// `(entityType, organizationId)` emitted after a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_type: String,
    pub organization_id: String,
}

impl ChangeEvent {
    pub fn new(entity_type: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            organization_id: organization_id.into(),
        }
    }
}

/// Fan-out channel of change events.
///
/// Publishing never waits on subscribers. A subscriber that falls more than
/// `capacity` events behind skips the overflow and is told how many it lost.
/// Every subscriber observes events in publish order.
#[derive(Clone)]
pub struct ChangeBus {
    sender: Arc<Mutex<Option<broadcast::Sender<ChangeEvent>>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Returns the number of subscribers the event was handed to.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        trace!(event = ?event, "publishing change event");
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            // Send only fails when nobody is listening.
            Some(sender) => sender.send(event).unwrap_or(0),
            None => {
                warn!(event = ?event, "change bus is closed, dropping event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Subscribing after shutdown yields an already closed stream.
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        };
        ChangeSubscription { receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.sender.lock() {
            Ok(guard) => guard.as_ref().map(|s| s.receiver_count()).unwrap_or(0),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .map(|s| s.receiver_count())
                .unwrap_or(0),
        }
    }

    /// Stops the bus. Subscribers drain what was already published, then end.
    pub fn close(&self) {
        let mut guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            debug!("change bus closed");
        }
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChangeSubscription {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    /// Next event, or `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged, events skipped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Spawn a background task that logs every change event until the bus closes.
pub fn spawn_logging_listener(bus: &ChangeBus) -> tokio::task::JoinHandle<usize> {
    let mut subscription = bus.subscribe();
    tokio::spawn(async move {
        let mut seen = 0;
        while let Some(event) = subscription.recv().await {
            seen += 1;
            debug!(
                entity = %event.entity_type,
                organization = %event.organization_id,
                "change event"
            );
        }
        debug!("change bus closed, stopping listener");
        seen
    })
}
