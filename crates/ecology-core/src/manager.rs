//! Cross-context event fan-out.
//!
//! An [`EventBroadcasterManager`] serves one room to any number of execution
//! contexts (UI surfaces, workers). Each context owns a
//! [`ContextBroadcaster`] with its own subscriptions and queue; events reach it
//! only when the context drains that queue, so receivers always run on the
//! context that registered them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ecology_protocol::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::ecology::EcologyError;
use crate::event::{validate_name, EventBroadcaster, EventError, EventReceiver};
use crate::runtime::EcologyHandle;

/// Identifier of a registered context.
pub type ContextId = u64;

/// A delivery queued for one context.
#[derive(Debug, Clone)]
struct Delivery {
    event_type: Arc<str>,
    data: Arc<Vec<Value>>,
}

struct Shared {
    room: String,
    handle: EcologyHandle,
    contexts: DashMap<ContextId, mpsc::UnboundedSender<Delivery>>,
    /// Forwarding receivers installed on the room, by event type.
    forwarded: DashMap<String, Arc<dyn EventReceiver>>,
}

impl Shared {
    fn fan_out(&self, event_type: &str, data: &[Value]) -> usize {
        let delivery = Delivery {
            event_type: Arc::from(event_type),
            data: Arc::new(data.to_vec()),
        };
        let mut queued = 0;
        for context in self.contexts.iter() {
            if context.value().send(delivery.clone()).is_ok() {
                queued += 1;
            }
        }
        trace!(room = %self.room, event = %event_type, contexts = queued, "Queued for contexts");
        queued
    }

    /// Make sure the room forwards `event_type` to the contexts.
    fn ensure_forwarding(self: &Arc<Self>, event_type: &str) {
        let receiver: Arc<dyn EventReceiver> = match self.forwarded.entry(event_type.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(entry) => {
                let receiver: Arc<dyn EventReceiver> = Arc::new(ForwardingReceiver {
                    shared: Arc::downgrade(self),
                });
                entry.insert(Arc::clone(&receiver));
                receiver
            }
        };

        let room = self.room.clone();
        let event = event_type.to_string();
        let posted = self.handle.post(move |ecology| {
            let subscribed = ecology
                .room(&room)
                .map_err(|e| e.to_string())
                .and_then(|r| {
                    r.event_broadcaster_mut()
                        .subscribe(&event, receiver)
                        .map_err(|e| e.to_string())
                });
            match subscribed {
                Ok(()) => debug!(room = %room, event = %event, "Forwarding to contexts"),
                Err(e) => warn!(room = %room, event = %event, error = %e, "Cannot forward"),
            }
        });
        if posted.is_err() {
            self.forwarded.remove(event_type);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let installed: Vec<(String, Arc<dyn EventReceiver>)> = self
            .forwarded
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        if installed.is_empty() {
            return;
        }

        let room = self.room.clone();
        let posted = self.handle.post(move |ecology| {
            if let Ok(r) = ecology.room(&room) {
                for (event, receiver) in &installed {
                    r.event_broadcaster_mut().unsubscribe(event, receiver);
                }
                debug!(room = %room, events = installed.len(), "Stopped forwarding to contexts");
            }
        });
        if posted.is_err() {
            trace!(room = %self.room, "Ecology gone, forwarding receivers dropped with it");
        }
    }
}

/// Room-side receiver feeding the context queues.
struct ForwardingReceiver {
    shared: Weak<Shared>,
}

impl EventReceiver for ForwardingReceiver {
    fn handle_event(&self, event_type: &str, data: &[Value]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fan_out(event_type, data);
        }
    }
}

/// Serves one room to many contexts.
pub struct EventBroadcasterManager {
    shared: Arc<Shared>,
    next_context: AtomicU64,
}

impl EventBroadcasterManager {
    /// Create a manager for `room`.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid.
    pub fn new(handle: EcologyHandle, room: &str) -> Result<Self, EventError> {
        validate_name(room).map_err(EventError::InvalidRoomName)?;
        Ok(Self {
            shared: Arc::new(Shared {
                room: room.to_string(),
                handle,
                contexts: DashMap::new(),
                forwarded: DashMap::new(),
            }),
            next_context: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn room(&self) -> &str {
        &self.shared.room
    }

    /// Register a new context.
    pub fn register_context(&self) -> ContextBroadcaster {
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.contexts.insert(id, tx);
        debug!(room = %self.shared.room, context = id, "Context registered");

        ContextBroadcaster {
            id,
            shared: Arc::clone(&self.shared),
            broadcaster: EventBroadcaster::new(),
            queue: rx,
        }
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.shared.contexts.len()
    }

    /// Publish on the room from the ecology loop. Remote devices and every
    /// subscribed context receive the event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid or the loop has stopped.
    pub fn send_message(&self, event_type: &str, data: Vec<Value>) -> Result<(), EcologyError> {
        self.shared.handle.publish(&self.shared.room, event_type, data)
    }

    /// Queue an event for every registered context.
    ///
    /// Returns the number of contexts it was queued for.
    pub fn forward_message(&self, event_type: &str, data: &[Value]) -> usize {
        self.shared.fan_out(event_type, data)
    }

    /// Queue an event for every registered context without sending it to any
    /// other device.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid.
    pub fn post_local_event(&self, event_type: &str, data: &[Value]) -> Result<usize, EventError> {
        validate_name(event_type).map_err(EventError::InvalidEventType)?;
        Ok(self.shared.fan_out(event_type, data))
    }
}

/// One context's view of a managed room.
///
/// Dropping it deregisters the context.
pub struct ContextBroadcaster {
    id: ContextId,
    shared: Arc<Shared>,
    broadcaster: EventBroadcaster,
    queue: mpsc::UnboundedReceiver<Delivery>,
}

impl ContextBroadcaster {
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Subscribe a receiver in this context.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid.
    pub fn subscribe(
        &mut self,
        event_type: &str,
        receiver: Arc<dyn EventReceiver>,
    ) -> Result<(), EventError> {
        self.broadcaster.subscribe(event_type, receiver)?;
        self.shared.ensure_forwarding(event_type);
        Ok(())
    }

    pub fn unsubscribe(&mut self, event_type: &str, receiver: &Arc<dyn EventReceiver>) -> bool {
        self.broadcaster.unsubscribe(event_type, receiver)
    }

    /// Publish on the room through the ecology loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid or the loop has stopped.
    pub fn publish(&self, event_type: &str, data: Vec<Value>) -> Result<(), EcologyError> {
        self.shared.handle.publish(&self.shared.room, event_type, data)
    }

    /// Queue an event for every context of the room, this one included.
    ///
    /// # Errors
    ///
    /// Returns an error if the event type is invalid.
    pub fn post_local_event(&self, event_type: &str, data: &[Value]) -> Result<usize, EventError> {
        validate_name(event_type).map_err(EventError::InvalidEventType)?;
        Ok(self.shared.fan_out(event_type, data))
    }

    /// Deliver every queued event without waiting. Returns how many were
    /// delivered.
    pub fn run_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(delivery) = self.queue.try_recv() {
            self.deliver(&delivery);
            delivered += 1;
        }
        delivered
    }

    /// Wait for the next queued event and deliver it.
    ///
    /// Returns `false` once the ecology shuts down.
    pub async fn next(&mut self) -> bool {
        let delivery = tokio::select! {
            _ = self.shared.handle.cancelled() => return false,
            delivery = self.queue.recv() => delivery,
        };
        match delivery {
            Some(delivery) => {
                self.deliver(&delivery);
                true
            }
            None => false,
        }
    }

    /// Deliver events until the ecology shuts down.
    pub async fn run(&mut self) {
        while self.next().await {}
    }

    fn deliver(&self, delivery: &Delivery) {
        self.broadcaster
            .dispatch(&delivery.event_type, delivery.data.as_slice());
    }
}

impl Drop for ContextBroadcaster {
    fn drop(&mut self) {
        self.shared.contexts.remove(&self.id);
        debug!(room = %self.shared.room, context = self.id, "Context deregistered");
    }
}
