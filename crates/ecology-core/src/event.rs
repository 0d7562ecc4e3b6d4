//! Room-scoped publish/subscribe.
//!
//! An [`EventBroadcaster`] maps event types to insertion-ordered lists of
//! receivers. Publishing dispatches synchronously to local receivers and, when
//! the broadcaster belongs to a room, hands the event to a [`MessageForwarder`]
//! so it reaches the rest of the ecology.

use ecology_protocol::{EcologyMessage, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Maximum length of event types and room names, in bytes.
pub const MAX_NAME_LENGTH: usize = 256;

/// Event errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// Invalid event type.
    #[error("Invalid event type: {0}")]
    InvalidEventType(&'static str),

    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoomName(&'static str),

    /// A room message could not be understood.
    #[error("Malformed event message: {0}")]
    MalformedEventMessage(&'static str),
}

/// Validate an event type or room name.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long, or contains
/// control characters.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("name contains invalid characters");
    }
    Ok(())
}

/// Something that reacts to events.
pub trait EventReceiver: Send + Sync {
    /// Handle one event.
    fn handle_event(&self, event_type: &str, data: &[Value]);
}

impl<F> EventReceiver for F
where
    F: Fn(&str, &[Value]) + Send + Sync,
{
    fn handle_event(&self, event_type: &str, data: &[Value]) {
        self(event_type, data);
    }
}

/// Carries a published event beyond the local broadcaster.
///
/// `arguments` is the event data with the event type appended as the last
/// element.
pub trait MessageForwarder: Send + Sync {
    fn forward(&self, arguments: Vec<Value>);
}

/// Identity of a receiver handle.
fn same_receiver(a: &Arc<dyn EventReceiver>, b: &Arc<dyn EventReceiver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// Publish/subscribe hub for one room or one context.
#[derive(Default)]
pub struct EventBroadcaster {
    subscriptions: HashMap<String, Vec<Arc<dyn EventReceiver>>>,
    forwarder: Option<Arc<dyn MessageForwarder>>,
}

impl EventBroadcaster {
    /// Create a broadcaster that only dispatches locally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broadcaster whose publishes are also forwarded.
    #[must_use]
    pub fn with_forwarder(forwarder: Arc<dyn MessageForwarder>) -> Self {
        Self {
            subscriptions: HashMap::new(),
            forwarder: Some(forwarder),
        }
    }

    /// Subscribe a receiver to an event type.
    ///
    /// The same receiver may be subscribed more than once; it is then invoked
    /// once per subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid.
    pub fn subscribe(
        &mut self,
        event_type: &str,
        receiver: Arc<dyn EventReceiver>,
    ) -> Result<(), EventError> {
        validate_name(event_type).map_err(EventError::InvalidEventType)?;

        let list = self.subscriptions.entry(event_type.to_string()).or_default();
        list.push(receiver);
        debug!(event = %event_type, receivers = list.len(), "Subscribed");
        Ok(())
    }

    /// Remove the first subscription of `receiver` to `event_type`.
    ///
    /// Returns `true` if a subscription was removed.
    pub fn unsubscribe(&mut self, event_type: &str, receiver: &Arc<dyn EventReceiver>) -> bool {
        let Some(list) = self.subscriptions.get_mut(event_type) else {
            return false;
        };
        let Some(index) = list.iter().position(|r| same_receiver(r, receiver)) else {
            return false;
        };

        list.remove(index);
        if list.is_empty() {
            self.subscriptions.remove(event_type);
        }
        debug!(event = %event_type, "Unsubscribed");
        true
    }

    /// Publish an event: forward it to the ecology, then dispatch it to the
    /// local receivers.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid.
    pub fn publish(&self, event_type: &str, data: Vec<Value>) -> Result<(), EventError> {
        validate_name(event_type).map_err(EventError::InvalidEventType)?;

        if let Some(forwarder) = &self.forwarder {
            let mut arguments = Vec::with_capacity(data.len() + 1);
            arguments.extend(data.iter().cloned());
            arguments.push(Value::String(event_type.to_string()));
            forwarder.forward(arguments);
        }

        self.dispatch(event_type, &data);
        Ok(())
    }

    /// Handle an event that arrived from another device.
    ///
    /// The event type is popped from the tail of the message; the remaining
    /// arguments are the event data.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MalformedEventMessage`] if the tail is not a
    /// valid event type. Nothing is dispatched in that case.
    pub fn on_room_message(&self, mut message: EcologyMessage) -> Result<(), EventError> {
        let event_type = match message.fetch_argument() {
            Some(Value::String(event_type)) => event_type,
            Some(_) => return Err(EventError::MalformedEventMessage("event type is not a string")),
            None => return Err(EventError::MalformedEventMessage("empty message")),
        };
        validate_name(&event_type).map_err(EventError::MalformedEventMessage)?;

        self.dispatch(&event_type, &message.into_arguments());
        Ok(())
    }

    /// Deliver an event to local receivers only.
    ///
    /// Returns the number of receivers invoked.
    pub fn dispatch(&self, event_type: &str, data: &[Value]) -> usize {
        let Some(list) = self.subscriptions.get(event_type) else {
            trace!(event = %event_type, "No receivers");
            return 0;
        };
        for receiver in list {
            receiver.handle_event(event_type, data);
        }
        trace!(event = %event_type, receivers = list.len(), "Dispatched");
        list.len()
    }

    /// Number of subscriptions for an event type.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscriptions.get(event_type).map_or(0, Vec::len)
    }

    /// Event types with at least one subscription.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("event_types", &self.subscriptions.len())
            .field("forwarding", &self.forwarder.is_some())
            .finish()
    }
}
