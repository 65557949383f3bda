//! Virtual streams carried by a [`MuxConn`].

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::window::SendWindow;
use super::{lock, MuxConn};
use crate::error::{PluginError, Result};
use crate::protocol::PacketKind;
use crate::writer::OutboundFrame;

const LOCAL_FIN: u8 = 0b01;
const REMOTE_FIN: u8 = 0b10;

/// Open-handshake state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Known locally but neither dialed nor accepted.
    Idle,
    /// `accept` is waiting for the peer's Syn.
    Listen,
    /// The peer's Syn arrived before our `accept`.
    SynReceived,
    /// `dial` sent Syn and waits for Ack.
    SynSent,
    /// Open in both directions.
    Established,
    /// The connection went away.
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Listen => "listen",
            StreamState::SynReceived => "syn-received",
            StreamState::SynSent => "syn-sent",
            StreamState::Established => "established",
            StreamState::Closed => "closed",
        }
    }
}

/// Shared per-stream bookkeeping, owned by the connection's stream table.
pub(crate) struct StreamEntry {
    pub(crate) id: u32,
    state: watch::Sender<StreamState>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    pub(crate) window: SendWindow,
    /// Bytes the peer may still send before overrunning our window.
    recv_budget: AtomicI64,
    fins: AtomicU8,
}

impl StreamEntry {
    pub(crate) fn new(id: u32, initial_window: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            id,
            state,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            window: SendWindow::new(initial_window),
            recv_budget: AtomicI64::new(i64::from(initial_window)),
            fins: AtomicU8::new(0),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Apply `f` to the current state atomically.
    ///
    /// Returns the previous state when `f` produced a new one, otherwise the
    /// unchanged current state as the error.
    pub(crate) fn transition(
        &self,
        f: impl FnOnce(StreamState) -> Option<StreamState>,
    ) -> std::result::Result<StreamState, StreamState> {
        let mut outcome = Err(StreamState::Closed);
        self.state.send_if_modified(|state| match f(*state) {
            Some(next) => {
                outcome = Ok(*state);
                *state = next;
                true
            }
            None => {
                outcome = Err(*state);
                false
            }
        });
        outcome
    }

    /// Wait until the stream is established or the connection is gone.
    pub(crate) async fn wait_established(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, StreamState::Established | StreamState::Closed))
            .await
            .map(|s| *s)
            .unwrap_or(StreamState::Closed);
        match state {
            StreamState::Established => Ok(()),
            _ => Err(PluginError::ConnectionClosed),
        }
    }

    /// Queue inbound payload for the reader.
    ///
    /// Fails when the peer sent more than the credit we granted it.
    pub(crate) fn deliver(&self, payload: Bytes) -> Result<()> {
        let remaining = self
            .recv_budget
            .fetch_sub(payload.len() as i64, Ordering::AcqRel)
            - payload.len() as i64;
        if remaining < 0 {
            return Err(PluginError::protocol(format!(
                "peer overran the window of stream {} by {} bytes",
                self.id, -remaining
            )));
        }
        if let Some(tx) = lock(&self.inbound_tx).as_ref() {
            // A dropped reader just discards data.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    /// Record our Fin. Returns true when both sides have now finished.
    pub(crate) fn finish_local(&self) -> bool {
        self.fins.fetch_or(LOCAL_FIN, Ordering::AcqRel) == REMOTE_FIN
    }

    /// Record the peer's Fin. Returns true when both sides have now finished.
    ///
    /// Call [`end_inbound`](Self::end_inbound) afterwards so the reader sees
    /// end-of-stream only once the Fin is recorded.
    pub(crate) fn finish_remote(&self) -> bool {
        self.fins.fetch_or(REMOTE_FIN, Ordering::AcqRel) == LOCAL_FIN
    }

    pub(crate) fn end_inbound(&self) {
        lock(&self.inbound_tx).take();
    }

    fn local_finished(&self) -> bool {
        self.fins.load(Ordering::Acquire) & LOCAL_FIN != 0
    }

    fn remote_finished(&self) -> bool {
        self.fins.load(Ordering::Acquire) & REMOTE_FIN != 0
    }

    /// Tear the stream down because the connection is gone.
    pub(crate) fn reset(&self) {
        self.state.send_modify(|s| *s = StreamState::Closed);
        self.end_inbound();
        self.window.close();
    }

    fn take_inbound(&self) -> mpsc::UnboundedReceiver<Bytes> {
        lock(&self.inbound_rx).take().unwrap_or_else(|| {
            // Already claimed: hand out a receiver that is immediately closed.
            let (_, rx) = mpsc::unbounded_channel();
            rx
        })
    }
}

/// An established bidirectional stream.
///
/// Use [`MuxStream::into_split`] to read and write from different tasks.
pub struct MuxStream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id())
            .field("state", &self.writer.entry.state())
            .finish()
    }
}

impl MuxStream {
    pub(crate) fn new(entry: Arc<StreamEntry>, conn: MuxConn) -> Self {
        let threshold = (conn.config().initial_window / 4).max(1);
        let reader = StreamReader {
            inbound: entry.take_inbound(),
            entry: entry.clone(),
            conn: conn.clone(),
            unacked: 0,
            ack_threshold: threshold,
        };
        let writer = StreamWriter {
            entry,
            conn,
            finished: false,
        };
        Self { reader, writer }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.writer.entry.id
    }

    /// See [`StreamReader::read_chunk`].
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        self.reader.read_chunk().await
    }

    /// See [`StreamWriter::write_all`].
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await
    }

    /// See [`StreamWriter::close`].
    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`MuxStream`].
pub struct StreamReader {
    entry: Arc<StreamEntry>,
    conn: MuxConn,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    unacked: u32,
    ack_threshold: u32,
}

impl StreamReader {
    #[inline]
    pub fn id(&self) -> u32 {
        self.entry.id
    }

    /// Next chunk of data in arrival order.
    ///
    /// Returns `Ok(None)` after the peer's Fin, and
    /// [`PluginError::ConnectionClosed`] if the connection died first.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.inbound.recv().await {
            Some(chunk) => {
                self.return_credit(chunk.len() as u32).await;
                Ok(Some(chunk))
            }
            None if self.entry.remote_finished() => Ok(None),
            None => Err(PluginError::ConnectionClosed),
        }
    }

    async fn return_credit(&mut self, consumed: u32) {
        self.unacked += consumed;
        if self.unacked < self.ack_threshold {
            return;
        }
        let credit = std::mem::take(&mut self.unacked);
        self.entry
            .recv_budget
            .fetch_add(i64::from(credit), Ordering::AcqRel);
        // If this fails the connection is gone and the next read reports it.
        let _ = self
            .conn
            .send_frame(OutboundFrame::window_update(self.entry.id, credit))
            .await;
    }
}

/// Write half of a [`MuxStream`].
///
/// Dropping it without calling [`close`](StreamWriter::close) still sends a
/// best-effort Fin.
pub struct StreamWriter {
    entry: Arc<StreamEntry>,
    conn: MuxConn,
    finished: bool,
}

impl StreamWriter {
    #[inline]
    pub fn id(&self) -> u32 {
        self.entry.id
    }

    /// Write all of `data`, split into frames no larger than the configured
    /// maximum, each waiting for send credit on this stream.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.finished || self.entry.local_finished() {
            return Err(PluginError::protocol(format!(
                "write on stream {} after close",
                self.entry.id
            )));
        }

        let max_frame = self.conn.config().max_data_frame.max(1);
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.entry.window.reserve(rest.len().min(max_frame)).await?;
            let (chunk, tail) = rest.split_at(n);
            self.conn
                .send_frame(OutboundFrame::data(
                    self.entry.id,
                    Bytes::copy_from_slice(chunk),
                ))
                .await?;
            rest = tail;
        }
        Ok(())
    }

    /// Half-close: tell the peer no more data follows. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }
        let result = self
            .conn
            .send_frame(OutboundFrame::control(self.entry.id, PacketKind::Fin))
            .await;
        self.conn.finish_local(&self.entry);
        result
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.conn
            .send_frame_nowait(OutboundFrame::control(self.entry.id, PacketKind::Fin));
        self.conn.finish_local(&self.entry);
    }
}
