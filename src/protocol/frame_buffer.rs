//! Frame buffer for accumulating partial reads.
//!
//! Socket reads arrive in arbitrary chunks. `FrameBuffer` keeps the leftover
//! bytes in a single `BytesMut` and walks a two-state machine:
//! - `WaitingForHeader`: need at least 9 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! # Example
//!
//! ```
//! use buildplug::protocol::{build_frame, FrameBuffer, Header, PacketKind};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(&Header::new(1, PacketKind::Data, 2), b"hi");
//!
//! assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[4..]).unwrap();
//! assert_eq!(frames[0].payload(), b"hi");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer (64 KiB initial capacity, 16 MiB max payload).
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an unknown frame kind, an oversized
    /// payload, or a malformed control frame. The buffer is unusable
    /// afterwards; the connection should be torn down.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer)? {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_payload_size)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.payload_length == 0 {
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }
                    self.state = State::WaitingForPayload {
                        header,
                        remaining: header.payload_length,
                    };
                }
                State::WaitingForPayload { header, remaining } => {
                    let remaining = *remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let header = *header;
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, PacketKind};

    fn data_frame(stream_id: u32, payload: &[u8]) -> Vec<u8> {
        build_frame(
            &Header::new(stream_id, PacketKind::Data, payload.len() as u32),
            payload,
        )
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = data_frame(1, b"first");
        combined.extend(build_frame(&Header::new(2, PacketKind::Syn, 0), &[]));
        combined.extend(data_frame(3, b"third"));

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream_id(), 1);
        assert_eq!(frames[1].kind(), PacketKind::Syn);
        assert!(frames[1].payload().is_empty());
        assert_eq!(frames[2].payload(), b"third");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = data_frame(1, b"test");

        assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&bytes[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"test");
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"a payload long enough to arrive in two socket reads";
        let bytes = data_frame(8, payload);

        let split = HEADER_SIZE + 10;
        assert!(buffer.push(&bytes[..split]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&bytes[split..]).unwrap();
        assert_eq!(frames[0].payload(), payload);
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = data_frame(4, b"xy");
        bytes.extend(data_frame(6, b"z"));

        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(buffer.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].stream_id(), 6);
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let header = Header::new(1, PacketKind::Data, 1000);

        let result = buffer.push(&header.encode());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }
}
