//! Replicated key/value data.
//!
//! One device of an ecology is the reference and holds the authoritative
//! store. Replicas ask it for a snapshot when they connect, reconcile, and
//! afterwards apply every change broadcast by any device. Consistency is
//! eventual: last write wins by arrival order.
//!
//! Wire layout, tail first: data sync channel kind, sync kind, then
//! `key` and `value` for data messages or the snapshot map for responses.

use dashmap::DashMap;
use ecology_protocol::{DeviceId, EcologyMessage, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Channel kind of data sync messages.
pub const DATA_SYNC_CHANNEL: i32 = 1;

/// A single key changed.
pub const DATA_SYNC_MESSAGE: i32 = 0;
/// A replica asks the reference for its store.
pub const INITIAL_DATA_SYNC_REQUEST: i32 = 1;
/// The reference answers with its store.
pub const INITIAL_DATA_SYNC_RESPONSE: i32 = 2;

/// Observer of data changes, invoked on the ecology loop.
///
/// `new` is `None` when the key was deleted, `old` is `None` when it was
/// created.
pub trait DataSyncListener: Send + Sync {
    fn on_data_changed(&self, key: &str, new: Option<&Value>, old: Option<&Value>);
}

impl<F> DataSyncListener for F
where
    F: Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync,
{
    fn on_data_changed(&self, key: &str, new: Option<&Value>, old: Option<&Value>) {
        self(key, new, old);
    }
}

/// Read-only view of the store, usable from any context.
#[derive(Debug, Clone)]
pub struct DataSyncHandle {
    store: Arc<DashMap<String, Value>>,
    synchronized: Arc<AtomicBool>,
}

impl DataSyncHandle {
    #[must_use]
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.store.get(key).map(|v| v.value().clone())
    }

    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    /// Keys currently stored, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Copy of the whole store, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .store
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// The key/value synchronization protocol of one ecology.
pub struct DataSync {
    store: Arc<DashMap<String, Value>>,
    is_reference: bool,
    synchronized: Arc<AtomicBool>,
    listeners: Vec<Arc<dyn DataSyncListener>>,
    outbound: mpsc::UnboundedSender<EcologyMessage>,
}

impl DataSync {
    pub(crate) fn new(is_reference: bool, outbound: mpsc::UnboundedSender<EcologyMessage>) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            is_reference,
            // the reference is synchronized with itself
            synchronized: Arc::new(AtomicBool::new(is_reference)),
            listeners: Vec::new(),
            outbound,
        }
    }

    #[must_use]
    pub fn handle(&self) -> DataSyncHandle {
        DataSyncHandle {
            store: Arc::clone(&self.store),
            synchronized: Arc::clone(&self.synchronized),
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.is_reference
    }

    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.store.get(key).map(|v| v.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn DataSyncListener>) {
        self.listeners.push(listener);
    }

    /// Remove the first registration of `listener`.
    pub fn remove_listener(&mut self, listener: &Arc<dyn DataSyncListener>) -> bool {
        let target = Arc::as_ptr(listener).cast::<()>();
        match self
            .listeners
            .iter()
            .position(|l| std::ptr::eq(Arc::as_ptr(l).cast::<()>(), target))
        {
            Some(index) => {
                self.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Store a value and broadcast the change.
    ///
    /// Nothing happens when the stored value is already equal to `value`.
    /// Setting [`Value::Null`] deletes the key. Returns whether the store
    /// changed.
    pub fn set_data(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        if !self.apply(key, value.clone()) {
            trace!(key, "Value unchanged");
            return false;
        }

        let mut message = EcologyMessage::new([value]);
        message.add_argument(key);
        message.add_argument(DATA_SYNC_MESSAGE);
        message.add_argument(DATA_SYNC_CHANNEL);
        self.queue(message);
        true
    }

    /// Remove every key, notifying each deletion. Nothing is broadcast.
    pub fn clear(&mut self) {
        for key in self.handle().keys() {
            self.apply(&key, Value::Null);
        }
    }

    /// A connector came up.
    pub(crate) fn on_connected(&mut self) {
        if self.is_reference || self.is_synchronized() {
            return;
        }
        debug!("Requesting initial data sync");
        let message = EcologyMessage::new([
            Value::Int32(INITIAL_DATA_SYNC_REQUEST),
            Value::Int32(DATA_SYNC_CHANNEL),
        ])
        .for_server();
        self.queue(message);
    }

    /// A connector went down.
    pub(crate) fn on_disconnected(&mut self) {
        if !self.is_reference && self.synchronized.swap(false, Ordering::SeqCst) {
            info!("Data sync lost synchronization");
        }
    }

    /// Handle a data sync message whose channel kind was already popped.
    pub(crate) fn on_message(&mut self, mut message: EcologyMessage) {
        match message.fetch_argument() {
            Some(Value::Int32(DATA_SYNC_MESSAGE)) => {
                let key = message.fetch_argument().and_then(Value::into_string);
                match (key, message.fetch_argument()) {
                    (Some(key), Some(value)) => {
                        self.apply(&key, value);
                    }
                    _ => warn!(source = ?message.source, "Malformed data sync message"),
                }
            }
            Some(Value::Int32(INITIAL_DATA_SYNC_REQUEST)) => {
                if self.is_reference {
                    self.respond(message.source);
                }
            }
            Some(Value::Int32(INITIAL_DATA_SYNC_RESPONSE)) => {
                if self.is_reference {
                    return;
                }
                match message.fetch_argument() {
                    Some(Value::Map(entries)) => self.reconcile(entries),
                    _ => warn!(source = ?message.source, "Malformed data sync response"),
                }
            }
            other => debug!(kind = ?other, "Ignoring unknown data sync kind"),
        }
    }

    fn respond(&self, requester: Option<DeviceId>) {
        let Some(requester) = requester else {
            warn!("Data sync request without source");
            return;
        };
        let entries = self
            .handle()
            .snapshot()
            .into_iter()
            .map(|(k, v)| (Value::String(k), v))
            .collect();

        debug!(device = %requester, keys = self.store.len(), "Answering data sync request");
        let message = EcologyMessage::new([
            Value::Map(entries),
            Value::Int32(INITIAL_DATA_SYNC_RESPONSE),
            Value::Int32(DATA_SYNC_CHANNEL),
        ])
        .for_devices([requester]);
        self.queue(message);
    }

    fn reconcile(&mut self, entries: Vec<(Value, Value)>) {
        let mut snapshot: HashMap<String, Value> = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            match key {
                Value::String(key) => {
                    snapshot.insert(key, value);
                }
                other => warn!(key = %other, "Ignoring non-string data sync key"),
            }
        }

        let stale: Vec<String> = self
            .handle()
            .keys()
            .into_iter()
            .filter(|k| !snapshot.contains_key(k))
            .collect();

        // every snapshot key is reported, unchanged ones included
        for (key, value) in snapshot {
            self.write(&key, value, true);
        }
        for key in stale {
            self.apply(&key, Value::Null);
        }

        self.synchronized.store(true, Ordering::SeqCst);
        info!(keys = self.store.len(), "Data sync synchronized");
    }

    /// Upsert or delete a key and notify listeners. Returns whether the
    /// store changed.
    fn apply(&self, key: &str, value: Value) -> bool {
        self.write(key, value, false)
    }

    fn write(&self, key: &str, value: Value, notify_unchanged: bool) -> bool {
        let (new, old) = if value.is_null() {
            match self.store.remove(key) {
                Some((_, old)) => (None, Some(old)),
                None => return false,
            }
        } else {
            let unchanged = self.store.get(key).is_some_and(|current| *current == value);
            if unchanged {
                if notify_unchanged {
                    for listener in &self.listeners {
                        listener.on_data_changed(key, Some(&value), Some(&value));
                    }
                }
                return false;
            }
            let old = self.store.insert(key.to_string(), value.clone());
            (Some(value), old)
        };

        trace!(key, "Data changed");
        for listener in &self.listeners {
            listener.on_data_changed(key, new.as_ref(), old.as_ref());
        }
        true
    }

    fn queue(&self, message: EcologyMessage) {
        if self.outbound.send(message).is_err() {
            trace!("Ecology gone, dropping data sync message");
        }
    }
}

impl std::fmt::Debug for DataSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSync")
            .field("is_reference", &self.is_reference)
            .field("synchronized", &self.is_synchronized())
            .field("keys", &self.store.len())
            .finish()
    }
}
