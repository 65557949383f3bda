//! Dedicated writer task for the physical connection.
//!
//! Every stream on a [`MuxConn`](crate::mux::MuxConn) shares one socket. Rather
//! than locking the write half, producers hand finished frames to a single
//! writer task over an mpsc channel. The task drains whatever is queued and
//! pushes it out with one vectored write.
//!
//! ```text
//! Stream 0 ─┐
//! Stream 3 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Stream 8 ─┘
//! ```
//!
//! Per-stream flow control happens before a frame reaches this channel (see
//! `mux::window`), so the channel itself only bounds total queued frames.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{PluginError, Result};
use crate::protocol::{Header, PacketKind, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum frames coalesced into one write.
pub const DEFAULT_MAX_BATCH: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for control frames).
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// A Syn/Ack/Fin frame for `stream_id`.
    #[inline]
    pub fn control(stream_id: u32, kind: PacketKind) -> Self {
        Self::new(&Header::new(stream_id, kind, 0), Bytes::new())
    }

    /// A data frame carrying `payload` on `stream_id`.
    #[inline]
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(
            &Header::new(stream_id, PacketKind::Data, payload.len() as u32),
            payload,
        )
    }

    /// A window update returning `credit` bytes to the peer.
    #[inline]
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self::new(
            &Header::new(stream_id, PacketKind::WindowUpdate, 4),
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Total encoded size (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames that may be queued before `send` waits.
    pub channel_capacity: usize,
    /// Upper bound on frames coalesced into one vectored write.
    pub max_batch: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// Cloneable handle for queueing frames on the writer task.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the channel is full.
    ///
    /// Fails with [`PluginError::ConnectionClosed`] once the writer task is gone.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| PluginError::ConnectionClosed)
    }

    /// Queue a frame without waiting.
    ///
    /// Used from `Drop` impls, where awaiting is impossible. Returns the frame
    /// back when the channel is full so the caller can decide what to do.
    pub fn try_send(&self, frame: OutboundFrame) -> std::result::Result<(), Option<OutboundFrame>> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => Some(frame),
            mpsc::error::TrySendError::Closed(_) => None,
        })
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, and with an error
/// when the socket rejects a write.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, config.max_batch.max(1)));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    max_batch: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(max_batch);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::warn!(error = %e, frames = batch.len(), "mux writer failed");
            return Err(e);
        }
        batch.clear();
    }

    // All handles dropped: the connection is being closed.
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O, looping over partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "socket accepted zero bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip` bytes of `batch`.
fn remaining_slices(batch: &[OutboundFrame], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip < end {
                slices.push(IoSlice::new(&part[skip.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_outbound_frame_sizes() {
        assert_eq!(OutboundFrame::control(1, PacketKind::Syn).size(), HEADER_SIZE);
        assert_eq!(
            OutboundFrame::data(1, Bytes::from_static(b"hello")).size(),
            HEADER_SIZE + 5
        );
        assert_eq!(OutboundFrame::window_update(1, 10).size(), HEADER_SIZE + 4);
    }

    #[test]
    fn test_remaining_slices_no_skip() {
        let batch = vec![OutboundFrame::data(1, Bytes::from_static(b"hello"))];
        assert_eq!(remaining_slices(&batch, 0).len(), 2);
    }

    #[test]
    fn test_remaining_slices_partial_header() {
        let batch = vec![OutboundFrame::data(1, Bytes::from_static(b"hello"))];
        let slices = remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_remaining_slices_into_second_frame() {
        let batch = vec![
            OutboundFrame::control(1, PacketKind::Fin),
            OutboundFrame::data(2, Bytes::from_static(b"abc")),
        ];
        let slices = remaining_slices(&batch, HEADER_SIZE + HEADER_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"bc");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5)
            .map(|i| OutboundFrame::data(i, Bytes::from_static(b"abc")))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();

        let frames = FrameBuffer::new().push(&buf.into_inner()).unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4].stream_id(), 4);
    }

    #[tokio::test]
    async fn test_writer_task_delivers_frames_in_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u32 {
            handle
                .send(OutboundFrame::data(7, Bytes::copy_from_slice(&i.to_be_bytes())))
                .await
                .unwrap();
        }

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut chunk = [0u8; 1024];
        while frames.len() < 10 {
            let n = server.read(&mut chunk).await.unwrap();
            frames.extend(buffer.push(&chunk[..n]).unwrap());
        }
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.payload(), &(i as u32).to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_after_writer_failure() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle
            .send(OutboundFrame::data(1, Bytes::from_static(b"lost")))
            .await
            .unwrap();
        assert!(task.await.unwrap().is_err());
        let err = handle
            .send(OutboundFrame::control(1, PacketKind::Fin))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ConnectionClosed));
    }
}
