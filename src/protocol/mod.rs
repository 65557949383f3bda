//! Protocol module - multiplexer wire format, framing, and frame types.
//!
//! - 9-byte frame header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    Header, PacketKind, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, PRIMARY_STREAM_ID,
    WINDOW_UPDATE_SIZE,
};
