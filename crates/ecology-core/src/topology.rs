//! Connector topology and message routing.
//!
//! Connectors are either core (fully meshed backbone) or dependent (reach the
//! ecology through core peers). The topology decides which connectors a
//! message goes to and whether the local device should see it.

use ecology_protocol::{DeviceId, EcologyMessage, TargetType};
use ecology_transport::{ConnectContext, Connector, ConnectorId, ConnectorRole, TransportError};
use std::collections::BTreeSet;
use tracing::{debug, error, trace, warn};

struct Slot {
    connector: Box<dyn Connector>,
    role: ConnectorRole,
    devices: BTreeSet<DeviceId>,
}

/// The connectors of one ecology.
pub struct Topology {
    local: DeviceId,
    is_reference: bool,
    slots: Vec<Slot>,
}

impl Topology {
    /// Create an empty topology for the local device.
    #[must_use]
    pub fn new(local: DeviceId, is_reference: bool) -> Self {
        Self {
            local,
            is_reference,
            slots: Vec::new(),
        }
    }

    #[must_use]
    pub fn local_device(&self) -> &DeviceId {
        &self.local
    }

    /// Register a connector; its role decides core or dependent membership.
    pub fn add(&mut self, connector: Box<dyn Connector>) -> ConnectorId {
        let role = connector.role();
        let id = self.slots.len();
        debug!(connector = id, %role, transport = connector.name(), "Connector added");
        self.slots.push(Slot {
            connector,
            role,
            devices: BTreeSet::new(),
        });
        id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Role of a connector.
    #[must_use]
    pub fn role(&self, id: ConnectorId) -> Option<ConnectorRole> {
        self.slots.get(id).map(|s| s.role)
    }

    pub fn on_device_connected(&mut self, id: ConnectorId, device: DeviceId) {
        if let Some(slot) = self.slots.get_mut(id) {
            debug!(connector = id, device = %device, "Device attached");
            slot.devices.insert(device);
        }
    }

    pub fn on_device_disconnected(&mut self, id: ConnectorId, device: &DeviceId) {
        if let Some(slot) = self.slots.get_mut(id) {
            if slot.devices.remove(device) {
                debug!(connector = id, device = %device, "Device detached");
            }
        }
    }

    /// Forget every device attached through a connector.
    pub fn clear_devices(&mut self, id: ConnectorId) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.devices.clear();
        }
    }

    /// True when at least one connector is registered and all of them are
    /// connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(|s| s.connector.is_connected())
    }

    /// Number of connectors reporting connected.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.connector.is_connected())
            .count()
    }

    /// Devices reachable through any connector.
    #[must_use]
    pub fn connected_devices(&self) -> BTreeSet<DeviceId> {
        self.slots
            .iter()
            .flat_map(|s| s.devices.iter().cloned())
            .collect()
    }

    /// Whether a message originated here and came back around the mesh.
    #[must_use]
    pub fn is_own(&self, message: &EcologyMessage) -> bool {
        message.source.as_ref() == Some(&self.local)
    }

    /// Whether the local device is a destination of `message`.
    #[must_use]
    pub fn should_dispatch_locally(&self, message: &EcologyMessage) -> bool {
        match message.target_type {
            TargetType::Broadcast => true,
            TargetType::Specific => message.targets.contains(&self.local),
            TargetType::Server => self.is_reference,
        }
    }

    /// Send a locally originated message.
    ///
    /// Returns the number of connectors the message was handed to.
    pub fn send(&self, message: &EcologyMessage) -> usize {
        self.route(message, None)
    }

    /// Forward a message that arrived on connector `from` to the other
    /// connectors. It is never echoed back to `from`.
    pub fn forward(&self, from: ConnectorId, message: &EcologyMessage) -> usize {
        let Some(origin) = self.slots.get(from) else {
            warn!(connector = from, "Message from unknown connector");
            return 0;
        };
        trace!(
            connector = from,
            core = origin.role.is_core(),
            "Forwarding"
        );
        self.route(message, Some(from))
    }

    fn route(&self, message: &EcologyMessage, exclude: Option<ConnectorId>) -> usize {
        let mut sent = 0;
        for id in self.candidates(message, exclude) {
            match self.slots[id].connector.send_message(message) {
                Ok(()) => sent += 1,
                Err(TransportError::NotConnected) => {
                    trace!(connector = id, "Skipping disconnected connector");
                }
                Err(e) => error!(connector = id, error = %e, "Send failed"),
            }
        }
        sent
    }

    /// Connectors a message should leave through.
    ///
    /// `Server` messages travel on every link until they reach the
    /// reference. `Specific` messages go to the links the targets are
    /// attached to; targets further away are reached by sending on every
    /// link.
    fn candidates(&self, message: &EcologyMessage, exclude: Option<ConnectorId>) -> Vec<ConnectorId> {
        let others = (0..self.slots.len()).filter(|id| Some(*id) != exclude);

        match message.target_type {
            TargetType::Broadcast => others.collect(),
            TargetType::Server if self.is_reference => Vec::new(),
            TargetType::Server => others.collect(),
            TargetType::Specific => {
                if message.targets.is_empty() {
                    debug!("Specific message without targets, not sent");
                    return Vec::new();
                }
                if message.targets.iter().all(|t| *t == self.local) {
                    return Vec::new();
                }
                let others: Vec<ConnectorId> = others.collect();
                let attached: Vec<ConnectorId> = others
                    .iter()
                    .copied()
                    .filter(|id| !self.slots[*id].devices.is_disjoint(&message.targets))
                    .collect();
                if attached.is_empty() {
                    debug!(targets = ?message.targets, "Targets not attached, sending on every link");
                    others
                } else {
                    attached
                }
            }
        }
    }

    /// Connect every connector. Failures are logged; the first one is
    /// returned after all connectors were tried.
    ///
    /// # Errors
    ///
    /// Returns the first connector error.
    pub async fn connect_all(&mut self, ctx: &ConnectContext) -> Result<(), TransportError> {
        let mut first = None;
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Err(e) = slot.connector.connect(ctx.clone()).await {
                error!(connector = id, role = %slot.role, error = %e, "Connect failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub async fn disconnect_all(&mut self) {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Err(e) = slot.connector.disconnect().await {
                warn!(connector = id, error = %e, "Disconnect failed");
            }
            slot.devices.clear();
        }
    }

    /// Release every connector immediately.
    pub fn force_close_all(&mut self) {
        for slot in &mut self.slots {
            slot.connector.force_close();
            slot.devices.clear();
        }
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("local", &self.local)
            .field("is_reference", &self.is_reference)
            .field("connectors", &self.slots.len())
            .finish()
    }
}
