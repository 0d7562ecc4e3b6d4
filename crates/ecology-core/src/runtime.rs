//! The ecology loop.
//!
//! One tokio task owns the [`Ecology`]. Connector callbacks and tasks posted
//! through an [`EcologyHandle`] are handled there one at a time, so rooms,
//! subscriptions and topology never need a lock.

use ecology_protocol::{DeviceId, Value};
use ecology_transport::{ConnectorEvent, ConnectorId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use crate::data_sync::DataSyncHandle;
use crate::ecology::{Ecology, EcologyError};
use crate::event::{validate_name, EventError};

/// A unit of work run on the ecology loop.
pub type Task = Box<dyn FnOnce(&mut Ecology) + Send>;

/// Spawns the ecology loop.
pub struct EcologyRuntime;

impl EcologyRuntime {
    /// Move `ecology` onto its own task.
    ///
    /// The returned join handle yields the ecology back once the loop has
    /// stopped and every connector was disconnected.
    #[must_use]
    pub fn spawn(mut ecology: Ecology) -> (EcologyHandle, JoinHandle<Ecology>) {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let handle = EcologyHandle {
            tasks: tasks_tx,
            data: ecology.data_handle(),
            cancel: ecology.cancel_token(),
            device_id: ecology.device_id().clone(),
        };

        let events = ecology.take_events();
        let join = tokio::spawn(run(ecology, tasks_rx, events));
        (handle, join)
    }
}

async fn run(
    mut ecology: Ecology,
    mut tasks: mpsc::UnboundedReceiver<Task>,
    events: Option<mpsc::UnboundedReceiver<(ConnectorId, ConnectorEvent)>>,
) -> Ecology {
    let Some(mut events) = events else {
        warn!("Ecology events already taken, loop not started");
        return ecology;
    };
    let cancel = ecology.cancel_token();
    info!(device = %ecology.device_id(), "Ecology loop started");

    // pick up anything queued before the loop existed
    ecology.flush();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some((id, event)) = events.recv() => {
                ecology.handle_connector_event(id, event);
            }

            task = tasks.recv() => match task {
                Some(task) => {
                    task(&mut ecology);
                    ecology.flush();
                }
                None => break,
            },
        }
    }

    ecology.disconnect_all().await;
    ecology.restore_events(events);
    info!(device = %ecology.device_id(), "Ecology loop stopped");
    ecology
}

/// Cloneable access to a running ecology loop.
#[derive(Debug, Clone)]
pub struct EcologyHandle {
    tasks: mpsc::UnboundedSender<Task>,
    data: DataSyncHandle,
    cancel: CancellationToken,
    device_id: DeviceId,
}

impl EcologyHandle {
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Run `task` on the ecology loop. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`EcologyError::LoopClosed`] if the loop has stopped.
    pub fn post<F>(&self, task: F) -> Result<(), EcologyError>
    where
        F: FnOnce(&mut Ecology) + Send + 'static,
    {
        self.tasks
            .send(Box::new(task))
            .map_err(|_| EcologyError::LoopClosed)
    }

    /// Run `task` on the ecology loop and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`EcologyError::LoopClosed`] if the loop stopped before the
    /// task ran.
    pub async fn request<F, R>(&self, task: F) -> Result<R, EcologyError>
    where
        F: FnOnce(&mut Ecology) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move |ecology| {
            let _ = tx.send(task(ecology));
        })?;
        rx.await.map_err(|_| EcologyError::LoopClosed)
    }

    /// Publish an event on a room.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid or the loop has stopped.
    pub fn publish(
        &self,
        room: &str,
        event_type: &str,
        data: Vec<Value>,
    ) -> Result<(), EcologyError> {
        validate_name(room).map_err(EventError::InvalidRoomName)?;
        validate_name(event_type).map_err(EventError::InvalidEventType)?;

        let room = room.to_string();
        let event_type = event_type.to_string();
        self.post(move |ecology| {
            if let Err(e) = ecology.publish(&room, &event_type, data) {
                warn!(room = %room, error = %e, "Publish failed");
            }
        })
    }

    /// Store a value on the loop and broadcast the change.
    ///
    /// # Errors
    ///
    /// Returns [`EcologyError::LoopClosed`] if the loop has stopped.
    pub fn set_data(&self, key: &str, value: impl Into<Value>) -> Result<(), EcologyError> {
        let key = key.to_string();
        let value = value.into();
        self.post(move |ecology| {
            ecology.set_data(&key, value);
        })
    }

    /// Read a value without going through the loop.
    #[must_use]
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.data.get_data(key)
    }

    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.data.is_synchronized()
    }

    #[must_use]
    pub fn data(&self) -> &DataSyncHandle {
        &self.data
    }

    /// Whether every connector is connected.
    ///
    /// # Errors
    ///
    /// Returns [`EcologyError::LoopClosed`] if the loop has stopped.
    pub async fn is_connected(&self) -> Result<bool, EcologyError> {
        self.request(|ecology| ecology.is_connected()).await
    }

    /// Stop the loop. Connectors are disconnected before the join handle
    /// completes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }

    /// Completes once shutdown was requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}
