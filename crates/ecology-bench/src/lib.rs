//! Shared fixtures for the ecology benchmarks.

use ecology_core::data_sync::{DATA_SYNC_CHANNEL, DATA_SYNC_MESSAGE};
use ecology_core::room::ROOM_CHANNEL;
use ecology_core::{Ecology, EcologyConfig, EcologyFactory, EcologyHandle, EcologyRuntime};
use ecology_protocol::{DeviceId, EcologyMessage, Value};
use ecology_transport::{ConnectorRole, LoopbackConnector};
use tokio::task::JoinHandle;

/// A running ecology.
pub struct Node {
    pub handle: EcologyHandle,
    pub join: JoinHandle<Ecology>,
}

/// Build an unconnected ecology.
///
/// # Panics
///
/// Panics if the configuration is rejected.
#[must_use]
pub fn ecology(device: &str, is_reference: bool) -> Ecology {
    EcologyFactory::new()
        .create(EcologyConfig {
            device_id: DeviceId::new(device),
            is_reference,
        })
        .expect("fresh factory")
}

/// Event data of `len` small values.
#[must_use]
pub fn payload(len: usize) -> Vec<Value> {
    (0..len)
        .map(|i| match i % 3 {
            0 => Value::from(i as i32),
            1 => Value::from(0.5f64 * i as f64),
            _ => Value::from("reading"),
        })
        .collect()
}

/// A room event as a remote device would send it.
#[must_use]
pub fn room_message(source: &str, room: &str, event_type: &str, data: Vec<Value>) -> EcologyMessage {
    let mut message = EcologyMessage::new(data).with_source(source);
    message.add_argument(event_type);
    message.add_argument(room);
    message.add_argument(ROOM_CHANNEL);
    message
}

/// A single-key data change as a remote device would send it.
#[must_use]
pub fn data_message(source: &str, key: &str, value: Value) -> EcologyMessage {
    let mut message = EcologyMessage::new([value]).with_source(source);
    message.add_argument(key);
    message.add_argument(DATA_SYNC_MESSAGE);
    message.add_argument(DATA_SYNC_CHANNEL);
    message
}

/// A reference `hub` and a replica `phone` joined by a loopback link, both
/// running.
///
/// # Panics
///
/// Panics if a connector fails to start.
pub async fn linked_pair() -> (Node, Node) {
    let mut hub = ecology("hub", true);
    let mut phone = ecology("phone", false);
    let (a, b) = LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
    hub.add_connector(Box::new(a));
    phone.add_connector(Box::new(b));

    hub.connect_all().await.expect("loopback connects");
    phone.connect_all().await.expect("loopback connects");

    let (handle, join) = EcologyRuntime::spawn(hub);
    let hub = Node { handle, join };
    let (handle, join) = EcologyRuntime::spawn(phone);
    let phone = Node { handle, join };
    (hub, phone)
}

/// Stop a node and wait for its loop to finish.
pub async fn stop(node: Node) {
    node.handle.shutdown();
    let _ = node.join.await;
}
