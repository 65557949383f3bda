//! Multiplexer frame header encoding and decoding.
//!
//! Every frame on the physical connection starts with a 9-byte header:
//! ```text
//! ┌───────────┬───────┬──────────┐
//! │ Stream ID │ Kind  │ Length   │
//! │ 4 bytes   │ 1 byte│ 4 bytes  │
//! │ uint32 BE │       │ uint32 BE│
//! └───────────┴───────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. `Length` counts payload bytes only.

use crate::error::{PluginError, Result};

/// Header size in bytes (fixed, exactly 9).
pub const HEADER_SIZE: usize = 9;

/// Default maximum payload accepted for a single inbound frame (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Stream reserved for the primary client→server call path.
pub const PRIMARY_STREAM_ID: u32 = 0;

/// Payload size of a `WindowUpdate` frame.
pub const WINDOW_UPDATE_SIZE: u32 = 4;

/// Frame kind carried in the header's kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Open request from the dialing side.
    Syn = 0,
    /// Open acknowledgement from the accepting side.
    Ack = 1,
    /// Half-close: the sender will write no more data.
    Fin = 2,
    /// Stream payload bytes.
    Data = 3,
    /// Receive credit returned to the sender.
    WindowUpdate = 4,
}

impl PacketKind {
    /// Parse a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketKind::Syn),
            1 => Some(PacketKind::Ack),
            2 => Some(PacketKind::Fin),
            3 => Some(PacketKind::Data),
            4 => Some(PacketKind::WindowUpdate),
            _ => None,
        }
    }

    /// Short lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Syn => "syn",
            PacketKind::Ack => "ack",
            PacketKind::Fin => "fin",
            PacketKind::Data => "data",
            PacketKind::WindowUpdate => "window_update",
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Stream the frame belongs to.
    pub stream_id: u32,
    /// What the frame means for the stream.
    pub kind: PacketKind,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(stream_id: u32, kind: PacketKind, payload_length: u32) -> Self {
        Self {
            stream_id,
            kind,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use buildplug::protocol::{Header, PacketKind};
    ///
    /// let header = Header::new(7, PacketKind::Data, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 9);
    /// assert_eq!(bytes[4], 3);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[4] = self.kind as u8;
        buf[5..9].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes.
    ///
    /// Returns `Ok(None)` if the buffer is too short and an error if the kind
    /// byte is unknown.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let kind = PacketKind::from_u8(buf[4])
            .ok_or_else(|| PluginError::protocol(format!("Unknown frame kind {}", buf[4])))?;
        Ok(Some(Self {
            stream_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind,
            payload_length: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        }))
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Payload length doesn't exceed max
    /// - Control frames (Syn/Ack/Fin) carry no payload
    /// - Window updates carry exactly a 4-byte credit
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(PluginError::protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        match self.kind {
            PacketKind::Syn | PacketKind::Ack | PacketKind::Fin if self.payload_length != 0 => {
                Err(PluginError::protocol(format!(
                    "{} frame on stream {} carries {} payload bytes",
                    self.kind.as_str(),
                    self.stream_id,
                    self.payload_length
                )))
            }
            PacketKind::WindowUpdate if self.payload_length != WINDOW_UPDATE_SIZE => {
                Err(PluginError::protocol(format!(
                    "window update on stream {} has length {}",
                    self.stream_id, self.payload_length
                )))
            }
            _ => Ok(()),
        }
    }

    /// Check if this is a control frame (no payload by definition).
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self.kind,
            PacketKind::Syn | PacketKind::Ack | PacketKind::Fin
        )
    }
}
