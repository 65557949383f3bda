//! Serving side of an RPC stream.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::Request;
use crate::codec::MessageReader;
use crate::error::{PluginError, Result};
use crate::handler::{HandlerRegistry, ReplySink, RequestContext};
use crate::mux::MuxStream;

/// Requests handled concurrently on one stream.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;

/// Serves requests arriving on a stream using a [`HandlerRegistry`].
///
/// Every request runs on its own task, so a slow method (`Builder.Run`)
/// never delays a fast one (`Builder.Cancel`) on the same stream.
#[derive(Clone)]
pub struct RpcServer {
    registry: Arc<HandlerRegistry>,
    max_concurrent: usize,
}

impl RpcServer {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            max_concurrent: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Serve until the client closes its side of the stream.
    ///
    /// In-flight requests finish and reply before the write side is closed.
    pub async fn serve(&self, stream: MuxStream) -> Result<()> {
        let stream_id = stream.id();
        let (reader, writer) = stream.into_split();
        let sink: ReplySink = Arc::new(Mutex::new(writer));
        let mut messages = MessageReader::new(reader);
        let limit = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        debug!(stream_id, "rpc server started");
        let result = loop {
            let request: Request = match messages.next().await {
                Ok(Some(request)) => request,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let permit = match limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break Err(PluginError::ConnectionClosed),
            };
            let registry = self.registry.clone();
            let ctx = RequestContext::with_sink(&request.method, request.seq, sink.clone());
            tasks.spawn(async move {
                let _permit = permit;
                handle_request(&registry, request, ctx).await;
            });

            while tasks.try_join_next().is_some() {}
        };

        while tasks.join_next().await.is_some() {}

        if let Err(e) = sink.lock().await.close().await {
            debug!(stream_id, error = %e, "closing rpc stream failed");
        }
        debug!(stream_id, "rpc server stopped");
        result
    }
}

async fn handle_request(registry: &HandlerRegistry, request: Request, ctx: RequestContext) {
    let outcome = AssertUnwindSafe(registry.dispatch(&request.method, &request.body, ctx.clone()))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) if ctx.has_responded() => return,
        Ok(Ok(())) => {
            warn!(method = %request.method, "handler returned without replying");
            format!("{} returned no result", request.method)
        }
        Ok(Err(e)) => e.to_string(),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(method = %request.method, panic = %message, "handler panicked");
            format!("{} panicked: {}", request.method, message)
        }
    };

    if ctx.has_responded() {
        debug!(method = %request.method, error = %failure, "handler failed after replying");
        return;
    }
    if let Err(e) = ctx.error(&failure).await {
        debug!(method = %request.method, error = %e, "could not deliver error reply");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use crate::testing::connected_pair;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn serve_registry(registry: HandlerRegistry) -> RpcClient {
        let (client, server) = connected_pair();
        let rpc = RpcServer::new(registry);
        tokio::spawn(async move {
            let stream = server.accept(1).await.unwrap();
            rpc.serve(stream).await
        });
        RpcClient::dial(&client, 1).await.unwrap()
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mut registry = HandlerRegistry::new();
        registry.register("Math.Double", |n: u64, ctx: RequestContext| async move {
            ctx.respond(&(n * 2)).await
        });
        let client = serve_registry(registry).await;

        let doubled: u64 = client.call("Math.Double", &21u64).await.unwrap();
        assert_eq!(doubled, 42);
    }

    #[tokio::test]
    async fn test_unknown_method_is_remote_error() {
        let client = serve_registry(HandlerRegistry::new()).await;

        let err = client.call::<_, ()>("Builder.Nope", &()).await.unwrap_err();
        assert!(matches!(&err, PluginError::Remote(m) if m.contains("Builder.Nope")));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_reply() {
        let mut registry = HandlerRegistry::new();
        registry.register("Builder.Prepare", |_: (), _ctx: RequestContext| async move {
            Err(PluginError::Remote("missing field: region".into()))
        });
        let client = serve_registry(registry).await;

        let err = client.call::<_, ()>("Builder.Prepare", &()).await.unwrap_err();
        assert_eq!(err.to_string(), "missing field: region");
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_stream() {
        let mut registry = HandlerRegistry::new();
        registry.register("Ui.Say", |msg: String, ctx: RequestContext| async move {
            if msg == "boom" {
                panic!("exploded");
            }
            ctx.respond(&()).await
        });
        let client = serve_registry(registry).await;

        let err = client.call::<_, ()>("Ui.Say", "boom").await.unwrap_err();
        assert!(err.to_string().contains("exploded"));
        client.call::<_, ()>("Ui.Say", "fine").await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_fast_call() {
        let release = Arc::new(Notify::new());
        let mut registry = HandlerRegistry::new();
        {
            let release = release.clone();
            registry.register("Builder.Run", move |_: (), ctx: RequestContext| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    ctx.respond(&"ran").await
                }
            });
        }
        registry.register("Builder.Cancel", |_: (), ctx: RequestContext| async move {
            ctx.respond(&()).await
        });
        let client = serve_registry(registry).await;

        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, String>("Builder.Run", &()).await })
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            client.call::<_, ()>("Builder.Cancel", &()),
        )
        .await
        .expect("fast call blocked")
        .unwrap();

        release.notify_one();
        assert_eq!(slow.await.unwrap().unwrap(), "ran");
    }

    #[tokio::test]
    async fn test_pending_calls_fail_when_connection_dies() {
        let (client, server) = connected_pair();
        let mut registry = HandlerRegistry::new();
        registry.register("Builder.Run", |_: (), _ctx: RequestContext| async move {
            std::future::pending::<()>().await;
            Ok(())
        });
        let rpc = RpcServer::new(registry);
        let server_conn = server.clone();
        tokio::spawn(async move {
            let stream = server_conn.accept(1).await.unwrap();
            rpc.serve(stream).await
        });
        let rpc_client = RpcClient::dial(&client, 1).await.unwrap();

        let call = {
            let rpc_client = rpc_client.clone();
            tokio::spawn(async move { rpc_client.call::<_, ()>("Builder.Run", &()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }
}
