//! The ecology: rooms, topology and data sync of one device.

use ecology_protocol::{DeviceId, EcologyMessage, TargetType, Value};
use ecology_transport::{
    ChannelReceiver, ConnectContext, Connector, ConnectorEvent, ConnectorId, TransportError,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::data_sync::{DataSync, DataSyncHandle, DATA_SYNC_CHANNEL};
use crate::event::EventError;
use crate::room::{Room, ROOM_CHANNEL};

/// Ecology errors.
#[derive(Debug, Error)]
pub enum EcologyError {
    /// The factory already built its ecology.
    #[error("Ecology already created")]
    AlreadyCreated,

    /// The ecology loop has stopped.
    #[error("Ecology loop closed")]
    LoopClosed,

    /// Event error.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Ecology configuration.
#[derive(Debug, Clone)]
pub struct EcologyConfig {
    /// Identity of the local device.
    pub device_id: DeviceId,
    /// Whether this device holds the authoritative data store.
    pub is_reference: bool,
}

impl Default for EcologyConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::generate(),
            is_reference: false,
        }
    }
}

/// Builds the single [`Ecology`] of a process.
#[derive(Debug, Default)]
pub struct EcologyFactory {
    created: AtomicBool,
}

impl EcologyFactory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            created: AtomicBool::new(false),
        }
    }

    /// Create the ecology.
    ///
    /// # Errors
    ///
    /// Returns [`EcologyError::AlreadyCreated`] on every call after the
    /// first.
    pub fn create(&self, config: EcologyConfig) -> Result<Ecology, EcologyError> {
        if self.created.swap(true, Ordering::SeqCst) {
            return Err(EcologyError::AlreadyCreated);
        }
        Ok(Ecology::new(config))
    }
}

/// State of one device's ecology.
///
/// Not thread safe: everything here is driven from the ecology loop (see
/// [`crate::EcologyRuntime`]) or, in embedded and test setups, from
/// [`Ecology::process_pending_events`].
pub struct Ecology {
    config: EcologyConfig,
    topology: crate::topology::Topology,
    rooms: HashMap<String, Room>,
    data_sync: DataSync,
    outbound_tx: mpsc::UnboundedSender<EcologyMessage>,
    outbound_rx: mpsc::UnboundedReceiver<EcologyMessage>,
    events_tx: mpsc::UnboundedSender<(ConnectorId, ConnectorEvent)>,
    events_rx: Option<mpsc::UnboundedReceiver<(ConnectorId, ConnectorEvent)>>,
    cancel: CancellationToken,
}

impl Ecology {
    fn new(config: EcologyConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            device = %config.device_id,
            reference = config.is_reference,
            "Creating ecology"
        );

        Self {
            topology: crate::topology::Topology::new(
                config.device_id.clone(),
                config.is_reference,
            ),
            rooms: HashMap::new(),
            data_sync: DataSync::new(config.is_reference, outbound_tx.clone()),
            outbound_tx,
            outbound_rx,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
            config,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.config.is_reference
    }

    /// Token cancelled on shutdown, shared with every connector.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Get a room, creating it on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid.
    pub fn room(&mut self, name: &str) -> Result<&mut Room, EcologyError> {
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let room = Room::new(name, self.outbound_tx.clone())?;
                debug!(room = %name, "Creating room");
                Ok(entry.insert(room))
            }
        }
    }

    /// Get an existing room.
    #[must_use]
    pub fn get_room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Publish an event on a room and send it out.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name or event type is invalid.
    pub fn publish(
        &mut self,
        room: &str,
        event_type: &str,
        data: Vec<Value>,
    ) -> Result<(), EcologyError> {
        self.room(room)?.event_broadcaster().publish(event_type, data)?;
        self.flush();
        Ok(())
    }

    /// Register a connector and attach the ecology's receiver to it.
    pub fn add_connector(&mut self, mut connector: Box<dyn Connector>) -> ConnectorId {
        let id = self.topology.len();
        connector.set_receiver(Arc::new(ChannelReceiver::new(id, self.events_tx.clone())));
        self.topology.add(connector)
    }

    #[must_use]
    pub fn data_sync(&self) -> &DataSync {
        &self.data_sync
    }

    pub fn data_sync_mut(&mut self) -> &mut DataSync {
        &mut self.data_sync
    }

    #[must_use]
    pub fn data_handle(&self) -> DataSyncHandle {
        self.data_sync.handle()
    }

    /// Store a value and send the change out.
    pub fn set_data(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let changed = self.data_sync.set_data(key, value);
        self.flush();
        changed
    }

    /// React to a connector callback.
    pub fn handle_connector_event(&mut self, id: ConnectorId, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Message(message) => self.on_message(id, message),
            ConnectorEvent::DeviceConnected(device) => {
                self.topology.on_device_connected(id, device);
            }
            ConnectorEvent::DeviceDisconnected(device) => {
                self.topology.on_device_disconnected(id, &device);
            }
            ConnectorEvent::Connected => {
                info!(connector = id, "Connector connected");
                self.data_sync.on_connected();
            }
            ConnectorEvent::Disconnected => {
                info!(connector = id, "Connector disconnected");
                self.topology.clear_devices(id);
                self.data_sync.on_disconnected();
            }
        }
        self.flush();
    }

    fn on_message(&mut self, id: ConnectorId, message: EcologyMessage) {
        if self.topology.is_own(&message) {
            trace!(connector = id, "Dropping own message");
            return;
        }

        self.topology.forward(id, &message);

        if self.topology.should_dispatch_locally(&message) {
            self.dispatch(message);
        }
    }

    /// Hand a message to the room or data sync layer named by its tail.
    fn dispatch(&mut self, mut message: EcologyMessage) {
        match message.fetch_argument() {
            Some(Value::Int32(ROOM_CHANNEL)) => {
                let room = match message.fetch_argument() {
                    Some(Value::String(room)) => room,
                    _ => {
                        warn!(source = ?message.source, "Room message without room name");
                        return;
                    }
                };
                let Some(target) = self.rooms.get(&room) else {
                    trace!(room = %room, "No local room");
                    return;
                };
                if let Err(e) = target.on_message(message) {
                    warn!(room = %room, error = %e, "Dropping room message");
                }
            }
            Some(Value::Int32(DATA_SYNC_CHANNEL)) => self.data_sync.on_message(message),
            other => warn!(channel = ?other, "Dropping message for unknown channel"),
        }
    }

    /// Send every queued message through the topology.
    ///
    /// Locally originated server and specific messages that are addressed to
    /// this device are dispatched here as well; broadcasts were already
    /// delivered locally when they were published.
    pub fn flush(&mut self) {
        while let Ok(mut message) = self.outbound_rx.try_recv() {
            message.source = Some(self.config.device_id.clone());
            self.topology.send(&message);

            let local = match message.target_type {
                TargetType::Broadcast => false,
                TargetType::Server | TargetType::Specific => {
                    self.topology.should_dispatch_locally(&message)
                }
            };
            if local {
                self.dispatch(message);
            }
        }
    }

    pub(crate) fn take_events(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<(ConnectorId, ConnectorEvent)>> {
        self.events_rx.take()
    }

    pub(crate) fn restore_events(
        &mut self,
        events: mpsc::UnboundedReceiver<(ConnectorId, ConnectorEvent)>,
    ) {
        self.events_rx = Some(events);
    }

    /// Handle every connector callback queued so far, then flush.
    ///
    /// Returns the number of callbacks handled. Used when the ecology is
    /// driven without [`crate::EcologyRuntime`].
    pub fn process_pending_events(&mut self) -> usize {
        let Some(mut events) = self.events_rx.take() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok((id, event)) = events.try_recv() {
            self.handle_connector_event(id, event);
            handled += 1;
        }
        self.events_rx = Some(events);
        self.flush();
        handled
    }

    /// Start every connector.
    ///
    /// # Errors
    ///
    /// Returns the first connector error; the other connectors are still
    /// started.
    pub async fn connect_all(&mut self) -> Result<(), EcologyError> {
        let ctx = ConnectContext::new(self.config.device_id.clone())
            .with_cancel(self.cancel.child_token());
        self.topology.connect_all(&ctx).await?;
        Ok(())
    }

    pub async fn disconnect_all(&mut self) {
        self.topology.disconnect_all().await;
        self.data_sync.on_disconnected();
    }

    /// Release every connector without a graceful goodbye.
    pub fn force_close(&mut self) {
        self.cancel.cancel();
        self.topology.force_close_all();
    }

    /// True when at least one connector exists and all are connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.topology.is_connected()
    }

    #[must_use]
    pub fn connected_connectors(&self) -> usize {
        self.topology.connected_count()
    }

    #[must_use]
    pub fn connector_count(&self) -> usize {
        self.topology.len()
    }

    /// Remote devices reachable through any connector.
    #[must_use]
    pub fn connected_devices(&self) -> BTreeSet<DeviceId> {
        self.topology.connected_devices()
    }
}

impl std::fmt::Debug for Ecology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecology")
            .field("device_id", &self.config.device_id)
            .field("is_reference", &self.config.is_reference)
            .field("rooms", &self.rooms.len())
            .field("topology", &self.topology)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventReceiver;
    use ecology_transport::{ConnectorRole, LoopbackConnector};
    use std::sync::Mutex;

    fn ecology(device: &str, is_reference: bool) -> Ecology {
        EcologyFactory::new()
            .create(EcologyConfig {
                device_id: DeviceId::new(device),
                is_reference,
            })
            .unwrap()
    }

    fn event_log(ecology: &mut Ecology, room: &str, event: &str) -> Arc<Mutex<Vec<Vec<Value>>>> {
        let log: Arc<Mutex<Vec<Vec<Value>>>> = Arc::default();
        let sink = Arc::clone(&log);
        let receiver: Arc<dyn EventReceiver> = Arc::new(move |_: &str, data: &[Value]| {
            sink.lock().unwrap().push(data.to_vec());
        });
        ecology
            .room(room)
            .unwrap()
            .event_broadcaster_mut()
            .subscribe(event, receiver)
            .unwrap();
        log
    }

    #[test]
    fn test_factory_creates_once() {
        let factory = EcologyFactory::new();
        assert!(factory.create(EcologyConfig::default()).is_ok());
        assert!(matches!(
            factory.create(EcologyConfig::default()),
            Err(EcologyError::AlreadyCreated)
        ));
    }

    #[test]
    fn test_rooms_are_created_lazily() {
        let mut eco = ecology("phone", false);
        assert!(eco.get_room("lobby").is_none());
        assert_eq!(eco.room("lobby").unwrap().name(), "lobby");
        assert_eq!(eco.room_names(), vec!["lobby".to_string()]);
        assert!(eco.room("").is_err());
    }

    #[test]
    fn test_local_publish_dispatches_once() {
        let mut eco = ecology("phone", false);
        let log = event_log(&mut eco, "lobby", "tap");

        eco.publish("lobby", "tap", vec![Value::from(1)]).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![vec![Value::from(1)]]);
    }

    #[test]
    fn test_not_connected_without_connectors() {
        let eco = ecology("phone", false);
        assert!(!eco.is_connected());
        assert!(eco.connected_devices().is_empty());
    }

    #[test]
    fn test_inbound_room_message_dispatched() {
        let mut eco = ecology("watch", false);
        let log = event_log(&mut eco, "lobby", "tap");

        let mut message = EcologyMessage::new([Value::from(5)]).with_source("phone");
        message.add_argument("tap");
        message.add_argument("lobby");
        message.add_argument(ROOM_CHANNEL);
        eco.handle_connector_event(0, ConnectorEvent::Message(message.clone()));
        assert_eq!(*log.lock().unwrap(), vec![vec![Value::from(5)]]);

        // own messages coming back around the mesh are dropped
        let own = message.with_source("watch");
        eco.handle_connector_event(0, ConnectorEvent::Message(own));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_flush_dispatches_messages_addressed_to_self() {
        let mut eco = ecology("phone", false);
        let log = event_log(&mut eco, "lobby", "tap");

        let mut message =
            EcologyMessage::new([Value::from(5)]).for_devices([DeviceId::new("phone")]);
        message.add_argument("tap");
        message.add_argument("lobby");
        message.add_argument(ROOM_CHANNEL);
        eco.outbound_tx.send(message).unwrap();
        eco.flush();

        assert_eq!(*log.lock().unwrap(), vec![vec![Value::from(5)]]);
    }

    #[tokio::test]
    async fn test_pair_over_loopback() {
        let mut hub = ecology("hub", true);
        let mut phone = ecology("phone", false);
        let (a, b) = LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
        hub.add_connector(Box::new(a));
        phone.add_connector(Box::new(b));
        hub.set_data("volume", 7);

        hub.connect_all().await.unwrap();
        phone.connect_all().await.unwrap();
        assert!(hub.is_connected() && phone.is_connected());

        for _ in 0..50 {
            tokio::task::yield_now().await;
            hub.process_pending_events();
            phone.process_pending_events();
            if phone.data_sync().is_synchronized() {
                break;
            }
        }

        assert!(phone.data_sync().is_synchronized());
        assert_eq!(phone.data_handle().get_data("volume"), Some(Value::from(7)));
        assert_eq!(
            phone.connected_devices(),
            BTreeSet::from([DeviceId::new("hub")])
        );

        phone.disconnect_all().await;
        assert!(!phone.data_sync().is_synchronized());
    }

    async fn pump_until_synchronized(hub: &mut Ecology, phone: &mut Ecology) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
            hub.process_pending_events();
            phone.process_pending_events();
            if phone.data_sync().is_synchronized() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_catches_up_on_missed_delete() {
        let mut hub = ecology("hub", true);
        let mut phone = ecology("phone", false);
        let (a, b) = LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
        hub.add_connector(Box::new(a));
        phone.add_connector(Box::new(b));
        hub.set_data("a", 1);
        hub.set_data("b", 2);

        let changes: Arc<Mutex<Vec<(String, Option<Value>, Option<Value>)>>> = Arc::default();
        let sink = Arc::clone(&changes);
        phone.data_sync_mut().add_listener(Arc::new(
            move |key: &str, new: Option<&Value>, old: Option<&Value>| {
                sink.lock()
                    .unwrap()
                    .push((key.to_string(), new.cloned(), old.cloned()));
            },
        ));

        hub.connect_all().await.unwrap();
        phone.connect_all().await.unwrap();
        pump_until_synchronized(&mut hub, &mut phone).await;
        assert_eq!(phone.data_handle().get_data("b"), Some(Value::from(2)));

        phone.disconnect_all().await;
        hub.disconnect_all().await;

        // nobody is listening, so the delete only lands on the hub
        hub.set_data("b", Value::Null);
        hub.process_pending_events();
        phone.process_pending_events();
        assert_eq!(phone.data_handle().get_data("b"), Some(Value::from(2)));

        hub.connect_all().await.unwrap();
        phone.connect_all().await.unwrap();
        pump_until_synchronized(&mut hub, &mut phone).await;

        assert!(phone.data_sync().is_synchronized());
        assert_eq!(phone.data_handle().get_data("a"), Some(Value::from(1)));
        assert_eq!(phone.data_handle().get_data("b"), None);
        assert_eq!(
            changes.lock().unwrap().last(),
            Some(&("b".to_string(), None, Some(Value::from(2))))
        );
    }
}
