//! Rooms.
//!
//! A room is a named channel of an ecology owning one [`EventBroadcaster`].
//! Events published on it are wrapped with the room name and the room channel
//! kind and queued for the topology.

use ecology_protocol::{EcologyMessage, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::event::{validate_name, EventBroadcaster, EventError, MessageForwarder};

/// Channel kind of room messages, the last argument on the wire.
pub const ROOM_CHANNEL: i32 = 0;

/// A named room.
#[derive(Debug)]
pub struct Room {
    name: String,
    broadcaster: EventBroadcaster,
}

impl Room {
    pub(crate) fn new(
        name: &str,
        outbound: mpsc::UnboundedSender<EcologyMessage>,
    ) -> Result<Self, EventError> {
        validate_name(name).map_err(EventError::InvalidRoomName)?;

        let forwarder = RoomForwarder {
            room: name.to_string(),
            outbound,
        };
        Ok(Self {
            name: name.to_string(),
            broadcaster: EventBroadcaster::with_forwarder(Arc::new(forwarder)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn event_broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn event_broadcaster_mut(&mut self) -> &mut EventBroadcaster {
        &mut self.broadcaster
    }

    /// Handle a room message whose room name and channel kind were already
    /// popped.
    pub(crate) fn on_message(&self, message: EcologyMessage) -> Result<(), EventError> {
        self.broadcaster.on_room_message(message)
    }
}

struct RoomForwarder {
    room: String,
    outbound: mpsc::UnboundedSender<EcologyMessage>,
}

impl MessageForwarder for RoomForwarder {
    fn forward(&self, arguments: Vec<Value>) {
        let mut message = EcologyMessage::new(arguments);
        message.add_argument(self.room.as_str());
        message.add_argument(ROOM_CHANNEL);
        if self.outbound.send(message).is_err() {
            trace!(room = %self.room, "Ecology gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_wraps_published_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let room = Room::new("lobby", tx).unwrap();

        room.event_broadcaster()
            .publish("tap", vec![Value::from(1)])
            .unwrap();

        let mut message = rx.try_recv().unwrap();
        assert_eq!(message.fetch_argument(), Some(Value::from(ROOM_CHANNEL)));
        assert_eq!(message.fetch_argument(), Some(Value::from("lobby")));
        assert_eq!(message.fetch_argument(), Some(Value::from("tap")));
        assert_eq!(message.fetch_argument(), Some(Value::from(1)));
        assert!(message.is_empty());
    }

    #[test]
    fn test_room_name_validation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            Room::new("", tx.clone()),
            Err(EventError::InvalidRoomName(_))
        ));
        assert!(Room::new("bad\tname", tx).is_err());
    }
}
