//! WebSocket connector.
//!
//! The server side binds a TCP listener and relays every frame it receives
//! from one client to its other clients. The client side dials the server and keeps redialing on an
//! interval until it is disconnected.

use async_trait::async_trait;
use bytes::Bytes;
use ecology_protocol::{DeviceId, EcologyMessage};
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{self, LinkFrame};
use crate::role::{ConnectorRole, Side};
use crate::traits::{ConnectContext, Connector, ConnectorReceiver, TransportError};

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind (server) or dial (client).
    pub address: String,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Delay between dial attempts.
    pub reconnect_interval: Duration,
    /// Frames buffered per session before the slowest session lags.
    pub outbound_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            max_message_size: frame::MAX_FRAME_SIZE,
            reconnect_interval: Duration::from_secs(1),
            outbound_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct Outbound {
    /// Session the frame came from, which must not see it again.
    origin: Option<u64>,
    data: Bytes,
}

/// A connector speaking link frames over WebSocket binary messages.
pub struct WebSocketConnector {
    role: ConnectorRole,
    config: WebSocketConfig,
    receiver: Option<Arc<dyn ConnectorReceiver>>,
    outbound: broadcast::Sender<Outbound>,
    connected: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketConnector {
    /// Create a connector with the given role.
    #[must_use]
    pub fn new(role: ConnectorRole, config: WebSocketConfig) -> Self {
        let (outbound, _) = broadcast::channel(config.outbound_capacity.max(1));
        Self {
            role,
            config,
            receiver: None,
            outbound,
            connected: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            cancel: None,
            task: None,
        }
    }

    /// Address the server side is listening on, once connected.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    fn url(&self) -> String {
        if self.config.address.starts_with("ws://") || self.config.address.starts_with("wss://") {
            self.config.address.clone()
        } else {
            format!("ws://{}", self.config.address)
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn role(&self) -> ConnectorRole {
        self.role
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn set_receiver(&mut self, receiver: Arc<dyn ConnectorReceiver>) {
        self.receiver = Some(receiver);
    }

    async fn connect(&mut self, ctx: ConnectContext) -> Result<(), TransportError> {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let receiver = self.receiver.clone().ok_or(TransportError::NoReceiver)?;
        let cancel = ctx.cancel.child_token();
        let shared = Arc::new(Shared {
            local: ctx.device_id,
            receiver,
            outbound: self.outbound.clone(),
            max_message_size: self.config.max_message_size,
            peers: Mutex::new(HashMap::new()),
        });

        let task = match self.role.side() {
            Side::Server => {
                let listener = TcpListener::bind(&self.config.address).await?;
                let addr = listener.local_addr()?;
                if let Ok(mut slot) = self.local_addr.lock() {
                    *slot = Some(addr);
                }
                info!(role = %self.role, %addr, "WebSocket connector listening");

                self.connected.store(true, Ordering::SeqCst);
                shared.receiver.on_connected();
                tokio::spawn(accept_loop(
                    listener,
                    shared,
                    Arc::clone(&self.connected),
                    cancel.clone(),
                ))
            }
            Side::Client => tokio::spawn(dial_loop(
                self.url(),
                self.config.reconnect_interval,
                shared,
                Arc::clone(&self.connected),
                cancel.clone(),
            )),
        };

        self.task = Some(task);
        self.cancel = Some(cancel);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "WebSocket connector task failed");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send_message(&self, message: &EcologyMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let data = frame::encode_message(message)?;
        // no open sessions is not an error
        let _ = self.outbound.send(Outbound { origin: None, data });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn force_close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State shared by every session of one connector.
struct Shared {
    local: DeviceId,
    receiver: Arc<dyn ConnectorReceiver>,
    outbound: broadcast::Sender<Outbound>,
    max_message_size: usize,
    /// Device announced on each server session.
    peers: Mutex<HashMap<u64, DeviceId>>,
}

impl Shared {
    fn relay(&self, origin: u64, data: Bytes) {
        let _ = self.outbound.send(Outbound {
            origin: Some(origin),
            data,
        });
    }

    fn known_peers(&self) -> Vec<DeviceId> {
        self.peers
            .lock()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn set_peer(&self, session: u64, device: Option<DeviceId>) {
        if let Ok(mut peers) = self.peers.lock() {
            match device {
                Some(device) => peers.insert(session, device),
                None => peers.remove(&session),
            };
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut next_session = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted TCP connection");
                    let session = next_session;
                    next_session += 1;
                    let shared = Arc::clone(&shared);
                    let outbound = shared.outbound.subscribe();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws) => run_session(ws, session, true, shared, outbound, cancel).await,
                            Err(e) => warn!(%addr, error = %e, "WebSocket handshake failed"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    shared.receiver.on_disconnected();
}

async fn dial_loop(
    url: String,
    interval: Duration,
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            dialed = connect_async(url.as_str()) => dialed,
        };

        match dialed {
            Ok((ws, _)) => {
                info!(%url, "WebSocket connector connected");
                let outbound = shared.outbound.subscribe();
                connected.store(true, Ordering::SeqCst);
                shared.receiver.on_connected();

                run_session(ws, 0, false, Arc::clone(&shared), outbound, cancel.clone()).await;

                connected.store(false, Ordering::SeqCst);
                shared.receiver.on_disconnected();
            }
            Err(e) => debug!(%url, error = %e, "Dial failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn send_frame<S>(ws: &mut WebSocketStream<S>, frame: LinkFrame) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frame.encode() {
        Ok(data) => ws.send(Message::Binary(data.to_vec())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode link frame");
            true
        }
    }
}

async fn run_session<S>(
    mut ws: WebSocketStream<S>,
    session: u64,
    relay: bool,
    shared: Arc<Shared>,
    mut outbound: broadcast::Receiver<Outbound>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !send_frame(&mut ws, LinkFrame::Hello(shared.local.clone())).await {
        return;
    }
    if relay {
        for peer in shared.known_peers() {
            if !send_frame(&mut ws, LinkFrame::Hello(peer)).await {
                return;
            }
        }
    }

    let mut devices: BTreeSet<DeviceId> = BTreeSet::new();
    let mut direct: Option<DeviceId> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                send_frame(&mut ws, LinkFrame::Goodbye(shared.local.clone())).await;
                let _ = ws.close(None).await;
                break;
            }

            out = outbound.recv() => match out {
                Ok(out) if out.origin == Some(session) => {}
                Ok(out) => {
                    if let Err(e) = ws.send(Message::Binary(out.data.to_vec())).await {
                        debug!(session, error = %e, "Session send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session, skipped, "Session lagging, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            inbound = ws.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > shared.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            shared.max_message_size
                        );
                        metrics::counter!("ecology_errors_total", "type" => "frame_too_large")
                            .increment(1);
                        continue;
                    }
                    let data = Bytes::from(data);
                    match LinkFrame::decode(&data) {
                        Ok(LinkFrame::Hello(device)) => {
                            if relay {
                                if direct.is_none() {
                                    direct = Some(device.clone());
                                    shared.set_peer(session, Some(device.clone()));
                                }
                                shared.relay(session, data);
                            }
                            if devices.insert(device.clone()) {
                                shared.receiver.on_device_connected(device);
                            }
                        }
                        Ok(LinkFrame::Goodbye(device)) => {
                            if relay {
                                shared.relay(session, data);
                            }
                            if devices.remove(&device) {
                                shared.receiver.on_device_disconnected(device);
                            }
                        }
                        Ok(LinkFrame::Message(message)) => {
                            if relay {
                                shared.relay(session, data);
                            }
                            shared.receiver.on_message(message);
                        }
                        Err(e) => warn!(session, error = %e, "Dropping malformed frame"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session, "WebSocket session closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    if relay {
        shared.set_peer(session, None);
        if let Some(device) = direct.filter(|d| devices.contains(d)) {
            if let Ok(data) = LinkFrame::Goodbye(device).encode() {
                shared.relay(session, data);
            }
        }
    }
    for device in devices {
        shared.receiver.on_device_disconnected(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChannelReceiver, ConnectorEvent, ConnectorId};
    use ecology_protocol::Value;
    use tokio::sync::mpsc;

    type Events = mpsc::UnboundedReceiver<(ConnectorId, ConnectorEvent)>;

    fn connector(role: ConnectorRole, address: String, id: ConnectorId) -> (WebSocketConnector, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connector = WebSocketConnector::new(
            role,
            WebSocketConfig {
                address,
                reconnect_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );
        connector.set_receiver(Arc::new(ChannelReceiver::new(id, tx)));
        (connector, rx)
    }

    async fn wait_for(events: &mut Events, mut pred: impl FnMut(&ConnectorEvent) -> bool) -> ConnectorEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (_, event) = events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for connector event")
    }

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, frame::MAX_FRAME_SIZE);
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_client_url() {
        let plain = WebSocketConnector::new(ConnectorRole::CoreClient, WebSocketConfig::default());
        assert_eq!(plain.url(), "ws://127.0.0.1:9000");

        let explicit = WebSocketConnector::new(
            ConnectorRole::CoreClient,
            WebSocketConfig {
                address: "ws://hub.local:80/ecology".into(),
                ..Default::default()
            },
        );
        assert_eq!(explicit.url(), "ws://hub.local:80/ecology");
    }

    #[tokio::test]
    async fn test_server_and_client_exchange_messages() {
        let (mut server, mut server_events) =
            connector(ConnectorRole::CoreServer, "127.0.0.1:0".into(), 0);
        server.connect(ConnectContext::new("hub")).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(server.is_connected());

        let (mut client, mut client_events) =
            connector(ConnectorRole::CoreClient, addr.to_string(), 1);
        client.connect(ConnectContext::new("phone")).await.unwrap();

        wait_for(&mut client_events, |e| {
            *e == ConnectorEvent::DeviceConnected(DeviceId::new("hub"))
        })
        .await;
        wait_for(&mut server_events, |e| {
            *e == ConnectorEvent::DeviceConnected(DeviceId::new("phone"))
        })
        .await;
        assert!(client.is_connected());

        let msg = EcologyMessage::new(vec![Value::from("tap")]).with_source("phone");
        client.send_message(&msg).unwrap();

        let received = wait_for(&mut server_events, |e| matches!(e, ConnectorEvent::Message(_))).await;
        assert_eq!(received, ConnectorEvent::Message(msg));

        client.disconnect().await.unwrap();
        wait_for(&mut server_events, |e| {
            *e == ConnectorEvent::DeviceDisconnected(DeviceId::new("phone"))
        })
        .await;
        server.disconnect().await.unwrap();
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_server_relays_between_clients() {
        let (mut server, _server_events) =
            connector(ConnectorRole::DependentServer, "127.0.0.1:0".into(), 0);
        server.connect(ConnectContext::new("hub")).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let (mut a, mut a_events) = connector(ConnectorRole::DependentClient, addr.clone(), 1);
        let (mut b, mut b_events) = connector(ConnectorRole::DependentClient, addr, 2);
        a.connect(ConnectContext::new("a")).await.unwrap();
        wait_for(&mut a_events, |e| *e == ConnectorEvent::Connected).await;
        b.connect(ConnectContext::new("b")).await.unwrap();

        // b learns about a through the server
        wait_for(&mut b_events, |e| {
            *e == ConnectorEvent::DeviceConnected(DeviceId::new("a"))
        })
        .await;
        wait_for(&mut a_events, |e| {
            *e == ConnectorEvent::DeviceConnected(DeviceId::new("b"))
        })
        .await;

        // the reference may be any client, so server-bound messages pass too
        let server_bound = EcologyMessage::new(vec![Value::from(1)]).with_source("a").for_server();
        let broadcast = EcologyMessage::new(vec![Value::from(2)]).with_source("a");
        a.send_message(&server_bound).unwrap();
        a.send_message(&broadcast).unwrap();

        let first = wait_for(&mut b_events, |e| matches!(e, ConnectorEvent::Message(_))).await;
        assert_eq!(first, ConnectorEvent::Message(server_bound));
        let second = wait_for(&mut b_events, |e| matches!(e, ConnectorEvent::Message(_))).await;
        assert_eq!(second, ConnectorEvent::Message(broadcast));

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
        server.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_message_within_default_limit() {
        let (mut server, _server_events) =
            connector(ConnectorRole::CoreServer, "127.0.0.1:0".into(), 0);
        server.connect(ConnectContext::new("hub")).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (mut client, mut client_events) =
            connector(ConnectorRole::CoreClient, addr.to_string(), 1);
        client.connect(ConnectContext::new("phone")).await.unwrap();
        wait_for(&mut client_events, |e| {
            *e == ConnectorEvent::DeviceConnected(DeviceId::new("hub"))
        })
        .await;

        // a snapshot well past the old 64 KB cap
        let snapshot = EcologyMessage::new(vec![Value::Blob(Bytes::from(vec![7u8; 200 * 1024]))])
            .with_source("hub")
            .for_devices([DeviceId::new("phone")]);
        server.send_message(&snapshot).unwrap();

        let received = wait_for(&mut client_events, |e| matches!(e, ConnectorEvent::Message(_))).await;
        assert_eq!(received, ConnectorEvent::Message(snapshot));

        client.disconnect().await.unwrap();
        server.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped() {
        let (mut server, _server_events) =
            connector(ConnectorRole::CoreServer, "127.0.0.1:0".into(), 0);
        server.connect(ConnectContext::new("hub")).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, mut client_events) = mpsc::unbounded_channel();
        let mut client = WebSocketConnector::new(
            ConnectorRole::CoreClient,
            WebSocketConfig {
                address: addr.to_string(),
                max_message_size: 1024,
                reconnect_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );
        client.set_receiver(Arc::new(ChannelReceiver::new(1, tx)));
        client.connect(ConnectContext::new("phone")).await.unwrap();
        wait_for(&mut client_events, |e| {
            *e == ConnectorEvent::DeviceConnected(DeviceId::new("hub"))
        })
        .await;

        let large = EcologyMessage::new(vec![Value::Blob(Bytes::from(vec![0u8; 4096]))]).with_source("hub");
        let small = EcologyMessage::new(vec![Value::from(1)]).with_source("hub");
        server.send_message(&large).unwrap();
        server.send_message(&small).unwrap();

        let received = wait_for(&mut client_events, |e| matches!(e, ConnectorEvent::Message(_))).await;
        assert_eq!(received, ConnectorEvent::Message(small));

        client.disconnect().await.unwrap();
        server.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_reports_not_connected_until_dialed() {
        let (mut client, _events) =
            connector(ConnectorRole::CoreClient, "127.0.0.1:1".into(), 0);
        client.connect(ConnectContext::new("phone")).await.unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_message(&EcologyMessage::default()),
            Err(TransportError::NotConnected)
        ));
        client.disconnect().await.unwrap();
    }
}
