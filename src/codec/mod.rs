//! Codec module - payload serialization and message framing.
//!
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde` (named fields)
//! - [`MessageReader`] / [`write_message`] - length-prefixed messages over a
//!   multiplexed stream
//!
//! # Example
//!
//! ```
//! use buildplug::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod framed;
mod msgpack;

pub use framed::{
    encode_message, write_message, MessageReader, DEFAULT_MAX_MESSAGE_SIZE, LENGTH_PREFIX_SIZE,
};
pub use msgpack::MsgPackCodec;
