//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named`: structs become maps keyed by field
//! name rather than positional arrays. Plugins are compiled independently of
//! the orchestrator, and named fields let either side add optional fields
//! without breaking the other.
//!
//! # Example
//!
//! ```
//! use buildplug::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct RunArgs {
//!     stream_id: u32,
//! }
//!
//! let encoded = MsgPackCodec::encode(&RunArgs { stream_id: 3 }).unwrap();
//! let decoded: RunArgs = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded.stream_id, 3);
//! ```

use crate::error::Result;

/// MessagePack codec for call arguments and replies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
