//! Calling side of an RPC stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{Request, Response};
use crate::codec::{write_message, MessageReader, MsgPackCodec};
use crate::error::{PluginError, Result};
use crate::mux::{lock, MuxConn, MuxStream, StreamWriter};

type ReplySender = oneshot::Sender<Result<Response>>;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, ReplySender>,
    /// Set once the response stream has ended; no new calls are accepted.
    closed: bool,
}

struct ClientInner {
    stream_id: u32,
    mux: MuxConn,
    writer: tokio::sync::Mutex<StreamWriter>,
    pending: Arc<Mutex<PendingCalls>>,
    next_seq: AtomicU64,
}

/// Client half of an RPC stream.
///
/// Cheap to clone; clones share the stream. When the last clone is dropped
/// the stream's write side is closed, which lets the serving side finish.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("stream_id", &self.inner.stream_id)
            .finish()
    }
}

impl RpcClient {
    /// Wrap an established stream. `mux` is the connection it belongs to,
    /// used by proxies that need to open further streams.
    pub fn new(stream: MuxStream, mux: MuxConn) -> Self {
        let stream_id = stream.id();
        let (reader, writer) = stream.into_split();
        let pending = Arc::new(Mutex::new(PendingCalls::default()));

        tokio::spawn(read_responses(MessageReader::new(reader), pending.clone()));

        Self {
            inner: Arc::new(ClientInner {
                stream_id,
                mux,
                writer: tokio::sync::Mutex::new(writer),
                pending,
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Dial stream `id` on `mux` and wrap it.
    pub async fn dial(mux: &MuxConn, id: u32) -> Result<Self> {
        let stream = mux.dial(id).await?;
        Ok(Self::new(stream, mux.clone()))
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id
    }

    #[inline]
    pub fn mux(&self) -> &MuxConn {
        &self.inner.mux
    }

    /// True once the server side of the stream has gone away.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.pending).closed
    }

    /// Call `method` with `args` and decode the result.
    ///
    /// An application error from the server comes back as
    /// [`PluginError::Remote`]; everything else that can go wrong here is a
    /// transport error.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = MsgPackCodec::encode(args)?;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock(&self.inner.pending);
            if pending.closed {
                return Err(PluginError::ConnectionClosed);
            }
            pending.calls.insert(seq, tx);
        }

        trace!(stream_id = self.inner.stream_id, seq, method, "rpc call");
        let request = Request {
            seq,
            method: method.to_string(),
            body,
        };
        let sent = {
            let writer = self.inner.writer.lock().await;
            write_message(&writer, &request).await
        };
        if let Err(e) = sent {
            lock(&self.inner.pending).calls.remove(&seq);
            return Err(e);
        }

        let response = rx.await.map_err(|_| PluginError::ConnectionClosed)??;
        if let Some(message) = response.error {
            return Err(PluginError::Remote(message));
        }
        MsgPackCodec::decode(&response.body)
    }
}

async fn read_responses(mut messages: MessageReader, pending: Arc<Mutex<PendingCalls>>) {
    let stream_id = messages.stream_id();
    let outcome = loop {
        match messages.next::<Response>().await {
            Ok(Some(response)) => {
                let waiter = lock(&pending).calls.remove(&response.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => warn!(stream_id, seq = response.seq, "response for unknown call"),
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };

    let orphaned = {
        let mut pending = lock(&pending);
        pending.closed = true;
        std::mem::take(&mut pending.calls)
    };

    match &outcome {
        Some(e) => debug!(stream_id, error = %e, pending = orphaned.len(), "rpc stream failed"),
        None => trace!(stream_id, pending = orphaned.len(), "rpc stream ended"),
    }

    for (_, tx) in orphaned {
        let err = match &outcome {
            Some(e) if !matches!(e, PluginError::ConnectionClosed) => {
                PluginError::protocol(e.to_string())
            }
            _ => PluginError::ConnectionClosed,
        };
        let _ = tx.send(Err(err));
    }
}
