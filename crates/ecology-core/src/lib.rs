//! # ecology-core
//!
//! The device-agnostic core of an Ecology: rooms with their event buses, the
//! connector topology, replicated key/value data and the loop that drives
//! them.
//!
//! - **Ecology** - rooms, topology and data sync of one device
//! - **Room / EventBroadcaster** - room-scoped publish/subscribe
//! - **Topology** - core/dependent forwarding and target resolution
//! - **DataSync** - reference/replica key/value synchronization
//! - **EcologyRuntime** - the single serialized ecology loop
//! - **EventBroadcasterManager** - fan-out of a room to many contexts
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  callbacks  ┌──────────────┐     ┌──────────┐
//! │ Connectors │────────────▶│ Ecology loop │────▶│  Rooms   │
//! └────────────┘             └──────────────┘     └──────────┘
//!        ▲                      │        │
//!        │      Topology        │        ▼
//!        └──────────────────────┘   ┌──────────┐
//!                                   │ DataSync │
//!                                   └──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use ecology_core::{EcologyConfig, EcologyFactory, EcologyRuntime};
//!
//! let mut ecology = EcologyFactory::new().create(EcologyConfig::default())?;
//! ecology.add_connector(Box::new(connector));
//! ecology.connect_all().await?;
//!
//! let (handle, _join) = EcologyRuntime::spawn(ecology);
//! handle.publish("lobby", "tap", vec![Value::from(1)])?;
//! ```

pub mod data_sync;
pub mod ecology;
pub mod event;
pub mod manager;
pub mod room;
pub mod runtime;
pub mod topology;

pub use data_sync::{DataSync, DataSyncHandle, DataSyncListener};
pub use ecology::{Ecology, EcologyConfig, EcologyError, EcologyFactory};
pub use event::{EventBroadcaster, EventError, EventReceiver};
pub use manager::{ContextBroadcaster, EventBroadcasterManager};
pub use room::Room;
pub use runtime::{EcologyHandle, EcologyRuntime};
pub use topology::Topology;
