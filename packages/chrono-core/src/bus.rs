//! Typed event bus for broadcasting lifecycle events.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss events
//! - **In-memory only**: events are not persisted
//! - **No replay**: lagged receivers get `RecvError::Lagged`
//!
//! The scheduler façade and every processor own their own bus; durability
//! lives in the task store, never in events.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Default channel capacity for an event bus.
const DEFAULT_CAPACITY: usize = 10_000;

/// An event plus the instant it was emitted.
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    /// Emission timestamp.
    pub at: DateTime<Utc>,
    /// The event payload.
    pub event: E,
}

/// Typed event bus over a broadcast channel.
///
/// Cloning shares the channel: all clones publish to, and subscriptions see,
/// the same stream. Events emitted before a subscription are not received.
///
/// # Example
///
/// ```ignore
/// let bus: EventBus<ProcessorEvent> = EventBus::new();
/// let mut receiver = bus.subscribe();
///
/// bus.emit(ProcessorEvent::UnknownProcessingError { error: "boom".into() });
///
/// let envelope = receiver.recv().await?;
/// println!("{} at {}", envelope.event, envelope.at);
/// ```
pub struct EventBus<E> {
    sender: broadcast::Sender<EventEnvelope<E>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events can be buffered before slow
    /// receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers (fire-and-forget).
    ///
    /// The envelope is stamped with the current instant. Returns the number
    /// of receivers that received the event.
    pub fn emit(&self, event: E) -> usize {
        let envelope = EventEnvelope {
            at: Utc::now(),
            event,
        };
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<E>> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}
