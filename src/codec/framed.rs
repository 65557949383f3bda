//! Length-prefixed messages over a multiplexed stream.
//!
//! A stream is an ordered byte pipe; chunk boundaries carry no meaning. Each
//! RPC message is written as a 4-byte big-endian length followed by its
//! MsgPack body, and [`MessageReader`] reassembles messages from whatever
//! chunks arrive.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::MsgPackCodec;
use crate::error::{PluginError, Result};
use crate::mux::{StreamReader, StreamWriter};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a single message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encode `value` with its length prefix.
pub fn encode_message<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let body = MsgPackCodec::encode(value)?;
    let len = u32::try_from(body.len())
        .map_err(|_| PluginError::protocol(format!("message of {} bytes too large", body.len())))?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Encode and write one message.
///
/// Callers sharing a writer must serialize calls so messages do not
/// interleave.
pub async fn write_message<T: Serialize + ?Sized>(writer: &StreamWriter, value: &T) -> Result<()> {
    writer.write_all(&encode_message(value)?).await
}

/// Reassembles length-prefixed messages from a [`StreamReader`].
pub struct MessageReader {
    reader: StreamReader,
    buffer: BytesMut,
    max_message_size: usize,
}

impl MessageReader {
    pub fn new(reader: StreamReader) -> Self {
        Self {
            reader,
            buffer: BytesMut::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.reader.id()
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between messages. A stream
    /// that ends mid-message is a protocol error.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(body) = self.try_split()? {
                return MsgPackCodec::decode(&body).map(Some);
            }

            match self.reader.read_chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if self.buffer.is_empty() => return Ok(None),
                None => {
                    return Err(PluginError::protocol(format!(
                        "stream {} ended inside a message ({} bytes buffered)",
                        self.reader.id(),
                        self.buffer.len()
                    )))
                }
            }
        }
    }

    fn try_split(&mut self) -> Result<Option<BytesMut>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > self.max_message_size {
            return Err(PluginError::protocol(format!(
                "message of {} bytes exceeds maximum {}",
                len, self.max_message_size
            )));
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }
        self.buffer.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len)))
    }
}
