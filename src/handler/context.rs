//! Request context for handlers.
//!
//! Every request gets exactly one reply:
//! - `respond` - send the encoded result
//! - `error` - send an application error message
//!
//! If a handler returns `Err` without replying, the server turns the error
//! into the reply.
//!
//! # Example
//!
//! ```ignore
//! async fn ask(query: String, ctx: RequestContext) -> Result<()> {
//!     let answer = prompt(&query).await?;
//!     ctx.respond(&answer).await
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::codec::{write_message, MsgPackCodec};
use crate::error::{PluginError, Result};
use crate::mux::StreamWriter;
use crate::rpc::Response;

/// Write half shared by every in-flight request on one stream.
pub(crate) type ReplySink = Arc<Mutex<StreamWriter>>;

/// Context passed to request handlers.
///
/// `Clone` so a handler can move it into spawned work; all clones share one
/// "already replied" flag.
#[derive(Clone)]
pub struct RequestContext {
    method: Arc<str>,
    seq: u64,
    sink: Option<ReplySink>,
    responded: Arc<AtomicBool>,
}

impl RequestContext {
    /// Create a context that discards replies (for testing without a stream).
    pub fn new(method: &str, seq: u64) -> Self {
        Self {
            method: Arc::from(method),
            seq,
            sink: None,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_sink(method: &str, seq: u64, sink: ReplySink) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(method, seq)
        }
    }

    /// Full method name, e.g. `"Builder.Run"`.
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// True once a reply was sent (or attempted).
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Reply with an encoded result.
    pub async fn respond<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let body = MsgPackCodec::encode(value)?;
        self.send(None, body).await
    }

    /// Reply with already-encoded MsgPack bytes.
    pub async fn respond_raw(&self, body: Vec<u8>) -> Result<()> {
        self.send(None, body).await
    }

    /// Reply with an application error. The caller sees `message` verbatim.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.send(Some(message.to_string()), Vec::new()).await
    }

    async fn send(&self, error: Option<String>, body: Vec<u8>) -> Result<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            return Err(PluginError::protocol(format!(
                "{} (seq {}) answered twice",
                self.method, self.seq
            )));
        }

        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let response = Response {
            seq: self.seq,
            error,
            body,
        };
        let writer = sink.lock().await;
        write_message(&writer, &response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_respond_without_sink() {
        let ctx = RequestContext::new("Ui.Say", 3);
        assert_eq!(ctx.method(), "Ui.Say");
        assert_eq!(ctx.seq(), 3);
        assert!(!ctx.has_responded());
        ctx.respond(&()).await.unwrap();
        assert!(ctx.has_responded());
    }

    #[tokio::test]
    async fn test_second_reply_rejected() {
        let ctx = RequestContext::new("Builder.Prepare", 1);
        let clone = ctx.clone();

        ctx.error("bad config").await.unwrap();
        let err = clone.respond(&"late").await.unwrap_err();
        assert!(err.to_string().contains("answered twice"));
    }
}
