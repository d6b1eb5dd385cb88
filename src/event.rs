//! Event-driven communication system for inter-service messaging.

use anyhow::Result;
use tokio::sync::broadcast;

use crate::{
    drivers::vibration::VibrationSample, failover::AuthorityTransition, scheduler::CycleSnapshot,
};

/// Type of configuration change detected
#[derive(Debug, Clone)]
pub enum ConfigChangeType {
    /// Configuration changes that can be applied without restart
    HotReload,
    /// Configuration changes that require full daemon restart
    ColdRestart {
        /// List of changed hardware-related sections
        changed_sections: Vec<String>,
    },
}

/// Application events for inter-service communication.
///
/// Events are published through the EventBus and consumed by interested services.
#[derive(Debug, Clone)]
pub enum Event {
    /// Configuration change detection with type classification
    ConfigChangeDetected(ConfigChangeType),
    SystemShutdown,
    /// Control authority moved between the remote system and local strategies.
    AuthorityChanged(AuthorityTransition),
    /// One equipment cycle finished.
    CycleCompleted(Box<CycleSnapshot>),
    VibrationSampled(VibrationSample),
    /// A vibration poller stopped after repeated failures.
    VibrationSuspended { sensor_id: String, failures: u32 },
    /// Request to resume a suspended vibration poller.
    ResumeVibration { sensor_id: String },
}

/// Event bus for publish-subscribe messaging between services.
///
/// The underlying broadcast channel is bounded; a subscriber that falls behind
/// observes `RecvError::Lagged` instead of blocking publishers.
///
/// # Example
///
/// ```no_run
/// use hvac_sequencer::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
/// event_bus.publish(Event::SystemShutdown).unwrap();
/// // In async context: subscriber.recv().await
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new EventBus with default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Publishes an event, ignoring the absence of subscribers.
    pub fn notify(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each subscriber receives all events published after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
