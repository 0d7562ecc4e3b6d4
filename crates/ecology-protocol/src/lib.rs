//! # ecology-protocol
//!
//! Wire protocol definitions for the Ecology device mesh.
//!
//! This crate defines the self-describing value codec shared by every
//! transport, and the message envelope that carries routing metadata.
//!
//! ## Value Tags
//!
//! - `i` / `u` / `h` - 32-bit signed, 32-bit unsigned, 64-bit signed integers
//! - `f` / `d` - single and double precision floats
//! - `s` / `b` - strings and blobs, padded to 4 bytes
//! - `c` / `C` - ASCII and non-ASCII characters
//! - `T` / `F` / `N` - booleans and null, no payload
//! - `[` ... `]` / `{` ... `}` - lists and maps
//!
//! ## Example
//!
//! ```rust
//! use ecology_protocol::{codec, Value};
//!
//! let values = vec![Value::from(42), Value::from("hi"), Value::from(true)];
//!
//! let encoded = codec::encode(&values).unwrap();
//! assert_eq!(&encoded[..4], b"isT\0");
//!
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, values);
//! ```

pub mod codec;
pub mod message;
pub mod value;

pub use codec::{decode, encode, CodecError};
pub use message::{DeviceId, EcologyMessage, TargetType};
pub use value::Value;
