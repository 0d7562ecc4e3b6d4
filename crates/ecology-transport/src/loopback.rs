//! In-memory connector pairs.
//!
//! A [`LoopbackConnector`] pair behaves like two ends of a real link: frames
//! go through the link codec, each end announces its device with a `Hello`
//! and reports the other end through its receiver. Used by tests, benches and
//! single-process demos.

use async_trait::async_trait;
use bytes::Bytes;
use ecology_protocol::{DeviceId, EcologyMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{self, LinkFrame};
use crate::role::ConnectorRole;
use crate::traits::{ConnectContext, Connector, ConnectorReceiver, TransportError};

/// One end of an in-memory link.
pub struct LoopbackConnector {
    role: ConnectorRole,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Option<mpsc::UnboundedReceiver<Bytes>>,
    receiver: Option<Arc<dyn ConnectorReceiver>>,
    connected: Arc<AtomicBool>,
    local: Option<DeviceId>,
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<mpsc::UnboundedReceiver<Bytes>>>,
}

impl LoopbackConnector {
    /// Create two connected ends with the given roles.
    #[must_use]
    pub fn pair(a: ConnectorRole, b: ConnectorRole) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a, a_tx, a_rx), Self::new(b, b_tx, b_rx))
    }

    fn new(
        role: ConnectorRole,
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            role,
            outbound,
            inbound: Some(inbound),
            receiver: None,
            connected: Arc::new(AtomicBool::new(false)),
            local: None,
            cancel: None,
            reader: None,
        }
    }

    fn send_frame(&self, data: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    fn role(&self) -> ConnectorRole {
        self.role
    }

    fn name(&self) -> &'static str {
        "loopback"
    }

    fn set_receiver(&mut self, receiver: Arc<dyn ConnectorReceiver>) {
        self.receiver = Some(receiver);
    }

    async fn connect(&mut self, ctx: ConnectContext) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let receiver = self.receiver.clone().ok_or(TransportError::NoReceiver)?;
        let inbound = self.inbound.take().ok_or(TransportError::ConnectionClosed)?;

        self.send_frame(LinkFrame::Hello(ctx.device_id.clone()).encode()?)?;

        let cancel = ctx.cancel.child_token();
        self.connected.store(true, Ordering::SeqCst);
        self.local = Some(ctx.device_id);
        receiver.on_connected();

        self.reader = Some(tokio::spawn(read_frames(
            inbound,
            receiver,
            cancel.clone(),
            Arc::clone(&self.connected),
        )));
        self.cancel = Some(cancel);

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(local) = self.local.take() {
            // the peer may already be gone
            let _ = self.send_frame(LinkFrame::Goodbye(local).encode()?);
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(reader) = self.reader.take() {
            match reader.await {
                Ok(inbound) => self.inbound = Some(inbound),
                Err(e) => warn!(error = %e, "Loopback reader task failed"),
            }
        }
        if let Some(receiver) = &self.receiver {
            receiver.on_disconnected();
        }
        Ok(())
    }

    fn send_message(&self, message: &EcologyMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.send_frame(frame::encode_message(message)?)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn force_close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_frames(
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    receiver: Arc<dyn ConnectorReceiver>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) -> mpsc::UnboundedReceiver<Bytes> {
    let mut peer: Option<DeviceId> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            data = inbound.recv() => {
                let Some(data) = data else {
                    debug!("Loopback peer dropped");
                    connected.store(false, Ordering::SeqCst);
                    receiver.on_disconnected();
                    break;
                };
                match LinkFrame::decode(&data) {
                    Ok(LinkFrame::Hello(device)) => {
                        peer = Some(device.clone());
                        receiver.on_device_connected(device);
                    }
                    Ok(LinkFrame::Goodbye(device)) => {
                        peer = None;
                        receiver.on_device_disconnected(device);
                    }
                    Ok(LinkFrame::Message(message)) => receiver.on_message(message),
                    Err(e) => warn!(error = %e, "Dropping malformed loopback frame"),
                }
            }
        }
    }

    if let Some(device) = peer {
        receiver.on_device_disconnected(device);
    }
    inbound
}
