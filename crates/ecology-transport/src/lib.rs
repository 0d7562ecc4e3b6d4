//! # ecology-transport
//!
//! Connector contract and bundled transports for the Ecology device mesh.
//!
//! The core only ever talks to a transport through the [`Connector`] trait
//! and receives its callbacks through a [`ConnectorReceiver`]:
//!
//! - **Loopback** - in-memory pairs for tests and single-process setups
//! - **WebSocket** - a server that relays among its clients, and a
//!   reconnecting client
//!
//! ```rust,ignore
//! use ecology_transport::{ConnectContext, Connector, ConnectorRole, LoopbackConnector};
//!
//! let (mut a, mut b) = LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
//! a.set_receiver(receiver);
//! a.connect(ConnectContext::new("phone")).await?;
//! ```

pub mod frame;
pub mod loopback;
pub mod role;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use frame::{LinkFrame, MAX_FRAME_SIZE};
pub use loopback::LoopbackConnector;
pub use role::{ConnectorRole, Membership, Side};
pub use traits::{
    ChannelReceiver, ConnectContext, Connector, ConnectorEvent, ConnectorId, ConnectorReceiver,
    TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
