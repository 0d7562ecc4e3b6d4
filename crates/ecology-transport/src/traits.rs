//! The connector contract.
//!
//! Every transport implements [`Connector`]. The ecology core hands each
//! connector a [`ConnectorReceiver`] and only ever observes the callbacks
//! defined here; retry, discovery and physical addressing stay inside the
//! transport.

use async_trait::async_trait;
use ecology_protocol::{CodecError, DeviceId, EcologyMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::role::ConnectorRole;

/// Index of a connector inside one ecology.
pub type ConnectorId = usize;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connector has not been connected yet.
    #[error("Connector not connected")]
    NotConnected,

    /// `connect` was called before `set_receiver`.
    #[error("No receiver attached")]
    NoReceiver,

    /// A link frame could not be understood.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Codec error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A callback observed by the ecology core.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// A message arrived.
    Message(EcologyMessage),
    /// A remote device became reachable through the connector.
    DeviceConnected(DeviceId),
    /// A remote device is no longer reachable through the connector.
    DeviceDisconnected(DeviceId),
    /// The connector itself came up.
    Connected,
    /// The connector itself went down.
    Disconnected,
}

/// Callbacks a connector invokes on the core.
///
/// Implementations must be cheap and must not block: connectors call them
/// from their own I/O tasks.
pub trait ConnectorReceiver: Send + Sync {
    /// A message arrived from a remote device.
    fn on_message(&self, message: EcologyMessage);

    /// A remote device became reachable.
    fn on_device_connected(&self, device: DeviceId);

    /// A remote device is gone.
    fn on_device_disconnected(&self, device: DeviceId);

    /// The connector came up.
    fn on_connected(&self);

    /// The connector went down.
    fn on_disconnected(&self);
}

/// Receiver that posts every callback, tagged with the connector id, onto a
/// queue drained by the ecology loop.
#[derive(Debug, Clone)]
pub struct ChannelReceiver {
    connector: ConnectorId,
    tx: mpsc::UnboundedSender<(ConnectorId, ConnectorEvent)>,
}

impl ChannelReceiver {
    /// Create a receiver for the given connector slot.
    #[must_use]
    pub fn new(
        connector: ConnectorId,
        tx: mpsc::UnboundedSender<(ConnectorId, ConnectorEvent)>,
    ) -> Self {
        Self { connector, tx }
    }

    fn post(&self, event: ConnectorEvent) {
        if self.tx.send((self.connector, event)).is_err() {
            trace!(connector = self.connector, "Ecology loop gone, dropping event");
        }
    }
}

impl ConnectorReceiver for ChannelReceiver {
    fn on_message(&self, message: EcologyMessage) {
        self.post(ConnectorEvent::Message(message));
    }

    fn on_device_connected(&self, device: DeviceId) {
        self.post(ConnectorEvent::DeviceConnected(device));
    }

    fn on_device_disconnected(&self, device: DeviceId) {
        self.post(ConnectorEvent::DeviceDisconnected(device));
    }

    fn on_connected(&self) {
        self.post(ConnectorEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.post(ConnectorEvent::Disconnected);
    }
}

/// Environment handed to [`Connector::connect`].
#[derive(Debug, Clone)]
pub struct ConnectContext {
    /// Identity of the local device, announced to peers.
    pub device_id: DeviceId,
    /// Cancelled when the owning ecology shuts down.
    pub cancel: CancellationToken,
}

impl ConnectContext {
    /// Create a context with a fresh cancellation token.
    #[must_use]
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A transport binding.
///
/// `connect` starts the connector and returns once its background tasks are
/// running; it must not wait for peers. Peers are reported through the
/// receiver.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Role of this connector in the topology.
    fn role(&self) -> ConnectorRole;

    /// Transport name (e.g., "websocket", "loopback").
    fn name(&self) -> &'static str;

    /// Attach the receiver for inbound callbacks.
    fn set_receiver(&mut self, receiver: Arc<dyn ConnectorReceiver>);

    /// Start the connector.
    async fn connect(&mut self, ctx: ConnectContext) -> Result<(), TransportError>;

    /// Stop the connector and release its resources.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Queue a message for delivery. Never blocks.
    fn send_message(&self, message: &EcologyMessage) -> Result<(), TransportError>;

    /// Check if the connector is up.
    fn is_connected(&self) -> bool;

    /// Release every resource immediately, without a graceful goodbye.
    fn force_close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecology_protocol::Value;

    #[test]
    fn test_channel_receiver_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = ChannelReceiver::new(3, tx);

        receiver.on_connected();
        receiver.on_device_connected(DeviceId::new("watch"));
        receiver.on_message(EcologyMessage::new(vec![Value::from(1)]));

        assert_eq!(rx.try_recv().unwrap(), (3, ConnectorEvent::Connected));
        assert_eq!(
            rx.try_recv().unwrap(),
            (3, ConnectorEvent::DeviceConnected(DeviceId::new("watch")))
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            (3, ConnectorEvent::Message(_))
        ));
    }

    #[test]
    fn test_channel_receiver_survives_closed_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let receiver = ChannelReceiver::new(0, tx);
        receiver.on_disconnected();
    }

    #[test]
    fn test_connect_context_cancel() {
        let parent = CancellationToken::new();
        let ctx = ConnectContext::new("phone").with_cancel(parent.child_token());
        assert_eq!(ctx.device_id.as_str(), "phone");
        parent.cancel();
        assert!(ctx.cancel.is_cancelled());
    }
}
