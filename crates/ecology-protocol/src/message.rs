//! The ecology message envelope.
//!
//! An [`EcologyMessage`] is an ordered argument list plus routing metadata.
//! Protocol layers stack their control fields onto the tail of the argument
//! list and the receiving side pops them off in reverse order with
//! [`EcologyMessage::fetch_argument`].

use bytes::Bytes;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{self, CodecError};
use crate::value::Value;

/// Identifier of a device participating in an ecology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a new device ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a device ID from the current time.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self(format!("device_{:x}", timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Routing mode of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum TargetType {
    /// Every device in the ecology.
    #[default]
    Broadcast = 0,
    /// The reference device.
    Server = 1,
    /// The devices listed in `targets`.
    Specific = 2,
}

impl From<TargetType> for i32 {
    fn from(tt: TargetType) -> i32 {
        tt as i32
    }
}

impl TryFrom<i32> for TargetType {
    type Error = &'static str;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TargetType::Broadcast),
            1 => Ok(TargetType::Server),
            2 => Ok(TargetType::Specific),
            _ => Err("Invalid target type"),
        }
    }
}

/// A message exchanged between ecology devices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EcologyMessage {
    arguments: VecDeque<Value>,
    /// Device that originated the message.
    pub source: Option<DeviceId>,
    /// Routing mode.
    pub target_type: TargetType,
    /// Destination devices, only meaningful for [`TargetType::Specific`].
    pub targets: BTreeSet<DeviceId>,
}

impl EcologyMessage {
    /// Create a broadcast message with the given arguments.
    #[must_use]
    pub fn new(arguments: impl IntoIterator<Item = Value>) -> Self {
        Self {
            arguments: arguments.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Set the source device.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<DeviceId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Address the message to the reference device.
    #[must_use]
    pub fn for_server(mut self) -> Self {
        self.target_type = TargetType::Server;
        self.targets.clear();
        self
    }

    /// Address the message to specific devices.
    #[must_use]
    pub fn for_devices(mut self, targets: impl IntoIterator<Item = DeviceId>) -> Self {
        self.target_type = TargetType::Specific;
        self.targets = targets.into_iter().collect();
        self
    }

    /// Append an argument to the tail.
    pub fn add_argument(&mut self, value: impl Into<Value>) {
        self.arguments.push_back(value.into());
    }

    /// Remove and return the last argument.
    pub fn fetch_argument(&mut self) -> Option<Value> {
        self.arguments.pop_back()
    }

    /// Remove and return the first argument.
    pub fn fetch_first_argument(&mut self) -> Option<Value> {
        self.arguments.pop_front()
    }

    /// Borrow the remaining arguments.
    #[must_use]
    pub fn arguments(&self) -> &VecDeque<Value> {
        &self.arguments
    }

    /// Consume the message, returning its arguments in order.
    #[must_use]
    pub fn into_arguments(self) -> Vec<Value> {
        self.arguments.into()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Whether `device` is a destination of this message.
    #[must_use]
    pub fn is_addressed_to(&self, device: &DeviceId) -> bool {
        match self.target_type {
            TargetType::Broadcast => true,
            TargetType::Server => false,
            TargetType::Specific => self.targets.contains(device),
        }
    }

    /// Encode the message, routing metadata included.
    ///
    /// Targets, target type and source are appended after the arguments in
    /// that order, so [`EcologyMessage::decode`] pops source first.
    ///
    /// # Errors
    ///
    /// Returns an error if an argument cannot be encoded.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut values: Vec<Value> = Vec::with_capacity(self.arguments.len() + 3);
        values.extend(self.arguments.iter().cloned());
        values.push(Value::List(
            self.targets
                .iter()
                .map(|t| Value::String(t.0.clone()))
                .collect(),
        ));
        values.push(Value::Int32(self.target_type.into()));
        values.push(
            self.source
                .as_ref()
                .map_or(Value::Null, |s| Value::String(s.0.clone())),
        );
        codec::encode(&values)
    }

    /// Decode a message produced by [`EcologyMessage::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or the routing trailer is
    /// missing.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut arguments: VecDeque<Value> = codec::decode(data)?.into();

        let source = match arguments.pop_back() {
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(DeviceId(s)),
            _ => return Err(CodecError::InvalidEnvelope("source")),
        };

        let target_type = match arguments.pop_back() {
            Some(Value::Int32(v)) => {
                TargetType::try_from(v).map_err(CodecError::InvalidEnvelope)?
            }
            _ => return Err(CodecError::InvalidEnvelope("target type")),
        };

        let targets = match arguments.pop_back() {
            Some(Value::List(items)) => items
                .into_iter()
                .map(|item| {
                    item.into_string()
                        .map(DeviceId)
                        .ok_or(CodecError::InvalidEnvelope("target"))
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
            _ => return Err(CodecError::InvalidEnvelope("targets")),
        };

        Ok(Self {
            arguments,
            source,
            target_type,
            targets,
        })
    }
}
