//! Stream multiplexer.
//!
//! A [`MuxConn`] turns one duplex connection (TCP or Unix socket) into any
//! number of independent, ordered, flow-controlled byte streams, each
//! addressed by a `u32` ID.
//!
//! - [`MuxConn::next_id`] mints a fresh ID. The side that dialed the physical
//!   connection mints odd IDs, the side that accepted it mints even IDs, so
//!   both peers can mint concurrently without colliding. ID 0 is reserved for
//!   the primary stream and is never minted.
//! - [`MuxConn::dial`] actively opens an ID, [`MuxConn::accept`] waits for the
//!   peer to open it. Both block until the other side performs the matching
//!   operation or the connection dies.
//!
//! One reader task demultiplexes inbound frames into per-stream queues
//! without ever waiting on a consumer; one writer task owns the socket's
//! write half.
//!
//! # Example
//!
//! ```ignore
//! let mux = MuxConn::new(socket, Role::Client, MuxConfig::default());
//! let id = mux.next_id()?;
//! // tell the peer about `id` over an existing stream, then:
//! let mut stream = mux.dial(id).await?;
//! stream.write_all(b"hello").await?;
//! ```

mod stream;
mod window;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{PluginError, Result};
use crate::protocol::{Frame, FrameBuffer, PacketKind, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

pub use stream::{MuxStream, StreamReader, StreamState, StreamWriter};
pub use window::DEFAULT_INITIAL_WINDOW;

use stream::StreamEntry;

/// Default maximum payload written in a single data frame (32 KiB).
pub const DEFAULT_MAX_DATA_FRAME: usize = 32 * 1024;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lock a std mutex, ignoring poisoning.
///
/// Every critical section here leaves the protected data consistent, so a
/// panic elsewhere does not invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which end of the physical connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the physical connection (the orchestrator). Mints odd IDs.
    Client,
    /// Accepted the physical connection (the plugin). Mints even IDs.
    Server,
}

impl Role {
    fn first_id(self) -> u64 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Multiplexer tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Bytes a peer may send on one stream before it must wait for credit.
    pub initial_window: u32,
    /// Largest payload we put in one data frame.
    pub max_data_frame: usize,
    /// Largest payload we accept in one inbound frame.
    pub max_frame_payload: u32,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_data_frame: DEFAULT_MAX_DATA_FRAME,
            max_frame_payload: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

struct MuxInner {
    role: Role,
    config: MuxConfig,
    streams: Mutex<HashMap<u32, Arc<StreamEntry>>>,
    next_id: Mutex<u64>,
    writer: WriterHandle,
    closed: CancellationToken,
}

/// Handle to a multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct MuxConn {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for MuxConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConn")
            .field("role", &self.inner.role)
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl MuxConn {
    /// Start multiplexing over `io`.
    ///
    /// Spawns the reader and writer tasks; must be called inside a Tokio
    /// runtime.
    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let closed = CancellationToken::new();

        let inner = Arc::new(MuxInner {
            role,
            config,
            streams: Mutex::new(HashMap::new()),
            next_id: Mutex::new(role.first_id()),
            writer,
            closed: closed.clone(),
        });

        tokio::spawn(read_loop(inner.clone(), read_half));

        // Writer supervision: a failed write ends the connection, and a local
        // close stops the writer.
        let supervised = inner.clone();
        tokio::spawn(async move {
            let mut writer_task = writer_task;
            tokio::select! {
                result = &mut writer_task => {
                    if let Ok(Err(e)) = result {
                        tracing::debug!(error = %e, "mux writer stopped");
                    }
                    supervised.shutdown("writer stopped");
                }
                _ = closed.cancelled() => writer_task.abort(),
            }
        });

        Self { inner }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub(crate) fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Mint a stream ID that is not currently in use.
    ///
    /// IDs are never reused on a connection. Once the 32-bit space is used up
    /// this fails with [`PluginError::StreamIdsExhausted`] instead of wrapping.
    pub fn next_id(&self) -> Result<u32> {
        let mut next = lock(&self.inner.next_id);
        let streams = lock(&self.inner.streams);
        loop {
            let candidate = *next;
            if candidate > u64::from(u32::MAX) {
                return Err(PluginError::StreamIdsExhausted);
            }
            *next = candidate + 2;
            let id = candidate as u32;
            if !streams.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Actively open stream `id` and wait for the peer to accept it.
    pub async fn dial(&self, id: u32) -> Result<MuxStream> {
        let entry = self.open_entry(id)?;
        entry
            .transition(|s| (s == StreamState::Idle).then_some(StreamState::SynSent))
            .map_err(|state| PluginError::StreamBusy {
                id,
                state: state.as_str(),
            })?;

        tracing::debug!(stream_id = id, "dialing stream");
        if let Err(e) = self
            .send_frame(OutboundFrame::control(id, PacketKind::Syn))
            .await
        {
            self.inner.remove(&entry);
            return Err(e);
        }

        self.wait_established(&entry).await?;
        Ok(MuxStream::new(entry, self.clone()))
    }

    /// Wait for the peer to dial stream `id`, then acknowledge it.
    pub async fn accept(&self, id: u32) -> Result<MuxStream> {
        let entry = self.open_entry(id)?;
        let previous = entry
            .transition(|s| match s {
                StreamState::Idle => Some(StreamState::Listen),
                StreamState::SynReceived => Some(StreamState::Established),
                _ => None,
            })
            .map_err(|state| PluginError::StreamBusy {
                id,
                state: state.as_str(),
            })?;

        tracing::debug!(stream_id = id, "accepting stream");
        if previous == StreamState::Idle {
            self.wait_established(&entry).await?;
        }

        self.send_frame(OutboundFrame::control(id, PacketKind::Ack))
            .await?;
        Ok(MuxStream::new(entry, self.clone()))
    }

    /// Close the physical connection. Every pending dial, accept, read and
    /// write fails with [`PluginError::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.shutdown("closed locally");
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed by either side.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Number of streams currently tracked.
    pub fn open_streams(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    fn open_entry(&self, id: u32) -> Result<Arc<StreamEntry>> {
        if self.is_closed() {
            return Err(PluginError::ConnectionClosed);
        }
        let entry = self.inner.entry_or_insert(id);
        // The connection may have died between the check and the insert.
        if self.is_closed() {
            entry.reset();
            return Err(PluginError::ConnectionClosed);
        }
        Ok(entry)
    }

    async fn wait_established(&self, entry: &StreamEntry) -> Result<()> {
        tokio::select! {
            result = entry.wait_established() => result,
            _ = self.inner.closed.cancelled() => Err(PluginError::ConnectionClosed),
        }
    }

    pub(crate) async fn send_frame(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closed() {
            return Err(PluginError::ConnectionClosed);
        }
        self.inner.writer.send(frame).await
    }

    /// Queue a frame from a synchronous context.
    pub(crate) fn send_frame_nowait(&self, frame: OutboundFrame) {
        if self.is_closed() {
            return;
        }
        match self.inner.writer.try_send(frame) {
            Ok(()) | Err(None) => {}
            Err(Some(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let writer = self.inner.writer.clone();
                    handle.spawn(async move {
                        let _ = writer.send(frame).await;
                    });
                }
            }
        }
    }

    /// Drop stream `id` if nobody has opened it yet. A pending `accept` on it
    /// fails. Returns whether the ID was released.
    pub(crate) fn forget_unopened(&self, id: u32) -> bool {
        let Some(entry) = self.inner.entry(id) else {
            return false;
        };
        let released = entry
            .transition(|s| {
                matches!(s, StreamState::Idle | StreamState::Listen).then_some(StreamState::Closed)
            })
            .is_ok();
        if released {
            self.inner.remove(&entry);
            entry.reset();
            tracing::debug!(stream_id = id, "unopened stream released");
        }
        released
    }

    pub(crate) fn finish_local(&self, entry: &Arc<StreamEntry>) {
        if entry.finish_local() {
            self.inner.remove(entry);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, next: u64) {
        *lock(&self.inner.next_id) = next;
    }
}

impl MuxInner {
    fn entry_or_insert(&self, id: u32) -> Arc<StreamEntry> {
        lock(&self.streams)
            .entry(id)
            .or_insert_with(|| Arc::new(StreamEntry::new(id, self.config.initial_window)))
            .clone()
    }

    fn entry(&self, id: u32) -> Option<Arc<StreamEntry>> {
        lock(&self.streams).get(&id).cloned()
    }

    fn remove(&self, entry: &Arc<StreamEntry>) {
        let mut streams = lock(&self.streams);
        if streams
            .get(&entry.id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            streams.remove(&entry.id);
            tracing::trace!(stream_id = entry.id, "stream removed");
        }
    }

    fn shutdown(&self, reason: &'static str) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let entries: Vec<_> = lock(&self.streams).drain().map(|(_, e)| e).collect();
        tracing::debug!(reason, streams = entries.len(), "mux connection closed");
        for entry in entries {
            entry.reset();
        }
    }

    /// Apply one inbound frame. An error is a protocol violation that ends
    /// the connection.
    fn handle_frame(&self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        match frame.kind() {
            PacketKind::Syn => {
                let entry = self.entry_or_insert(id);
                let result = entry.transition(|s| match s {
                    StreamState::Idle => Some(StreamState::SynReceived),
                    StreamState::Listen => Some(StreamState::Established),
                    _ => None,
                });
                if let Err(state) = result {
                    tracing::warn!(stream_id = id, state = state.as_str(), "unexpected syn");
                }
            }
            PacketKind::Ack => {
                let result = self.entry(id).map(|entry| {
                    entry.transition(|s| {
                        (s == StreamState::SynSent).then_some(StreamState::Established)
                    })
                });
                match result {
                    Some(Ok(_)) => {}
                    Some(Err(state)) => {
                        tracing::warn!(stream_id = id, state = state.as_str(), "unexpected ack")
                    }
                    None => tracing::warn!(stream_id = id, "ack for unknown stream"),
                }
            }
            PacketKind::Fin => match self.entry(id) {
                Some(entry) => {
                    if entry.finish_remote() {
                        self.remove(&entry);
                    }
                    entry.end_inbound();
                }
                None => tracing::debug!(stream_id = id, "fin for unknown stream"),
            },
            PacketKind::Data => match self.entry(id) {
                Some(entry) if entry.state() == StreamState::Established => {
                    entry.deliver(frame.payload)?
                }
                Some(entry) => tracing::warn!(
                    stream_id = id,
                    state = entry.state().as_str(),
                    bytes = frame.payload.len(),
                    "data before stream established, dropped"
                ),
                None => tracing::warn!(
                    stream_id = id,
                    bytes = frame.payload.len(),
                    "data for unknown stream, dropped"
                ),
            },
            PacketKind::WindowUpdate => {
                if let (Some(entry), Some(credit)) = (self.entry(id), frame.window_credit()) {
                    entry.window.grant(credit);
                }
            }
        }
        Ok(())
    }
}

async fn read_loop<R>(inner: Arc<MuxInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::with_max_payload(inner.config.max_frame_payload);
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        let n = tokio::select! {
            _ = inner.closed.cancelled() => break "closed locally",
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break "peer closed connection",
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "mux read failed");
                    break "read error";
                }
            },
        };

        let handled = buffer
            .push(&chunk[..n])
            .and_then(|frames| frames.into_iter().try_for_each(|frame| inner.handle_frame(frame)));
        if let Err(e) = handled {
            tracing::warn!(error = %e, "protocol violation, closing connection");
            break "protocol violation";
        }
    };

    inner.shutdown(reason);
}
