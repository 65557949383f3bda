//! Frame struct with typed accessors.
//!
//! A complete multiplexer frame: header plus payload, the payload shared
//! zero-copy via `bytes::Bytes`.
//!
//! # Example
//!
//! ```
//! use buildplug::protocol::{Frame, Header, PacketKind};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Header::new(3, PacketKind::Data, 5), Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.stream_id(), 3);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, PacketKind, HEADER_SIZE, WINDOW_UPDATE_SIZE};

/// A complete multiplexer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    /// Credit carried by a `WindowUpdate` frame.
    ///
    /// Returns `None` for any other frame kind.
    pub fn window_credit(&self) -> Option<u32> {
        if self.header.kind != PacketKind::WindowUpdate
            || self.payload.len() != WINDOW_UPDATE_SIZE as usize
        {
            return None;
        }
        let p = &self.payload;
        Some(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
    }
}

/// Build a complete frame as bytes (header + payload).
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
