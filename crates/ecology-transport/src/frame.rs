//! Link framing shared by the bundled connectors.
//!
//! Each frame is one kind byte followed by a body encoded with the value
//! codec. `Hello` and `Goodbye` announce the device at the other end of a
//! link; `Message` carries an encoded [`EcologyMessage`].

use bytes::{BufMut, Bytes, BytesMut};
use ecology_protocol::{codec, DeviceId, EcologyMessage, Value};

use crate::traits::TransportError;

/// Largest frame a link carries: a kind byte plus a maximal message.
pub const MAX_FRAME_SIZE: usize = 1 + codec::MAX_MESSAGE_SIZE;

const KIND_HELLO: u8 = 0x01;
const KIND_GOODBYE: u8 = 0x02;
const KIND_MESSAGE: u8 = 0x03;

/// A frame exchanged over a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    /// The sender's device id, sent once when the link opens.
    Hello(DeviceId),
    /// The sender is leaving.
    Goodbye(DeviceId),
    /// An ecology message.
    Message(EcologyMessage),
}

impl LinkFrame {
    /// Encode the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        match self {
            LinkFrame::Hello(device) => encode_device(KIND_HELLO, device),
            LinkFrame::Goodbye(device) => encode_device(KIND_GOODBYE, device),
            LinkFrame::Message(message) => encode_message(message),
        }
    }

    /// Decode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty buffer, an unknown kind or a malformed
    /// body.
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        let (&kind, body) = data
            .split_first()
            .ok_or(TransportError::Codec(ecology_protocol::CodecError::TruncatedInput))?;

        match kind {
            KIND_HELLO => Ok(LinkFrame::Hello(decode_device(body)?)),
            KIND_GOODBYE => Ok(LinkFrame::Goodbye(decode_device(body)?)),
            KIND_MESSAGE => Ok(LinkFrame::Message(EcologyMessage::decode(body)?)),
            other => Err(TransportError::InvalidFrame(format!(
                "unknown frame kind {other:#04x}"
            ))),
        }
    }
}

/// Encode a message frame without cloning the message.
///
/// # Errors
///
/// Returns an error if the message cannot be encoded.
pub fn encode_message(message: &EcologyMessage) -> Result<Bytes, TransportError> {
    let body = message.encode()?;
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(KIND_MESSAGE);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

fn encode_device(kind: u8, device: &DeviceId) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    buf.put_u8(kind);
    codec::encode_into(&[Value::from(device.as_str())], &mut buf)?;
    Ok(buf.freeze())
}

fn decode_device(body: &[u8]) -> Result<DeviceId, TransportError> {
    let mut values = codec::decode(body)?;
    match (values.pop(), values.is_empty()) {
        (Some(Value::String(id)), true) if !id.is_empty() => Ok(DeviceId(id)),
        _ => Err(TransportError::InvalidFrame("expected a device id".into())),
    }
}
