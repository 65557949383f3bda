//! Cross-process components.
//!
//! Each of the eight interfaces ([`Builder`], [`Provisioner`],
//! [`PostProcessor`], [`Datasource`], [`Hook`], [`Communicator`], [`Ui`],
//! [`Artifact`]) comes with two adapters:
//!
//! - a client proxy (`BuilderClient`, ...) implementing the trait by turning
//!   each method into an RPC call through a [`CommonClient`]
//! - a server adapter (`BuilderServer`, ...) implementing [`Service`], which
//!   registers the RPC handlers that forward to a real implementation
//!
//! Calls that need the remote side to call back (`Builder.Run`,
//! `Provisioner.Provision`, `PostProcessor.PostProcess`) mint a fresh stream,
//! serve the callback interfaces on it with [`serve_on_new_stream`], and pass
//! its ID in the request. Results that are themselves components
//! (artifacts) come back the same way, with stream ID `0` meaning "none".

mod artifact;
mod builder;
mod communicator;
mod datasource;
mod hook;
mod post_processor;
mod provisioner;
mod ui;

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::handler::{HandlerRegistry, RequestContext};
use crate::mux::{lock, MuxConn};
use crate::rpc::{RpcClient, RpcServer};

pub use artifact::{Artifact, ArtifactClient, ArtifactServer};
pub use builder::{Builder, BuilderClient, BuilderServer, PrepareOutput};
pub use communicator::{CommandOutput, Communicator, CommunicatorClient, CommunicatorServer, RemoteCmd};
pub use datasource::{Datasource, DatasourceClient, DatasourceServer};
pub use hook::{Hook, HookClient, HookServer};
pub use post_processor::{PostProcessOutput, PostProcessor, PostProcessorClient, PostProcessorServer};
pub use provisioner::{Provisioner, ProvisionerClient, ProvisionerServer};
pub use ui::{Ui, UiClient, UiServer};

/// Stream ID returned in place of a component that was not produced.
pub const NO_STREAM: u32 = 0;

/// The closed set of cross-process interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Builder,
    Provisioner,
    PostProcessor,
    Datasource,
    Hook,
    Communicator,
    Ui,
    Artifact,
}

impl Endpoint {
    /// RPC endpoint name, the part before the dot in `"Builder.Run"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Builder => "Builder",
            Endpoint::Provisioner => "Provisioner",
            Endpoint::PostProcessor => "PostProcessor",
            Endpoint::Datasource => "Datasource",
            Endpoint::Hook => "Hook",
            Endpoint::Communicator => "Communicator",
            Endpoint::Ui => "Ui",
            Endpoint::Artifact => "Artifact",
        }
    }

    /// Full RPC method name.
    pub fn method(&self, name: &str) -> String {
        format!("{}.{}", self.as_str(), name)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A component's declared configuration schema.
///
/// Opaque to the transport; by convention it holds JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl ConfigSpec {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

/// Shared base of every client proxy: an endpoint name bound to one RPC
/// stream. The stream's connection is reachable through [`mux`](Self::mux)
/// for proxies that open callback streams.
#[derive(Debug, Clone)]
pub struct CommonClient {
    endpoint: Endpoint,
    rpc: RpcClient,
}

impl CommonClient {
    pub fn new(endpoint: Endpoint, rpc: RpcClient) -> Self {
        Self { endpoint, rpc }
    }

    #[inline]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    #[inline]
    pub fn mux(&self) -> &MuxConn {
        self.rpc.mux()
    }

    #[inline]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Call `<endpoint>.<method>`.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.rpc.call(&self.endpoint.method(method), args).await
    }

    /// Call `<endpoint>.<method>`, asking the remote side to cancel if `ctx`
    /// fires while the call is still outstanding.
    ///
    /// Cancellation is cooperative: after sending `<endpoint>.Cancel` this
    /// keeps waiting for the original call to return. Once the call has
    /// returned, no `Cancel` is ever sent.
    pub async fn call_cancellable<A, R>(
        &self,
        method: &str,
        args: &A,
        ctx: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = self.call(method, args);
        tokio::pin!(call);

        tokio::select! {
            biased;
            result = &mut call => return result,
            _ = ctx.cancelled() => {}
        }

        debug!(endpoint = %self.endpoint, method, "context cancelled, cancelling remote call");
        let (result, cancelled) = tokio::join!(call, self.call::<_, ()>("Cancel", &()));
        if let Err(e) = cancelled {
            debug!(endpoint = %self.endpoint, error = %e, "cancel request failed");
        }
        result
    }
}

/// A server adapter exposing one local implementation over RPC.
pub trait Service: Send + Sync + 'static {
    fn endpoint(&self) -> Endpoint;

    /// Add this service's `"<endpoint>.*"` handlers to `registry`.
    fn register(self: Arc<Self>, registry: &mut HandlerRegistry);
}

/// Build a registry serving every service in `services`.
pub fn registry_for(services: Vec<Arc<dyn Service>>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for service in services {
        service.register(&mut registry);
    }
    registry
}

/// Mint a stream ID, serve `registry` on it once the peer dials it, and
/// return a handle carrying the ID for the peer.
///
/// The server runs in the background until the peer closes its side. If the
/// request carrying the ID fails, the peer never dials it; pass the result
/// through [`CallbackStream::settle`] so the ID is released.
pub fn serve_on_new_stream(mux: &MuxConn, registry: HandlerRegistry) -> Result<CallbackStream> {
    let id = mux.next_id()?;
    let abandoned = CancellationToken::new();
    let handle = CallbackStream {
        id,
        mux: mux.clone(),
        abandoned: abandoned.clone(),
    };

    let mux = mux.clone();
    tokio::spawn(async move {
        let accepted = tokio::select! {
            biased;
            _ = abandoned.cancelled() => {
                mux.forget_unopened(id);
                debug!(stream_id = id, "callback stream abandoned");
                return;
            }
            accepted = mux.accept(id) => accepted,
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                debug!(stream_id = id, error = %e, "callback stream never opened");
                return;
            }
        };
        if let Err(e) = RpcServer::new(registry).serve(stream).await {
            debug!(stream_id = id, error = %e, "callback server stopped with error");
        }
    });
    Ok(handle)
}

/// A stream minted by [`serve_on_new_stream`], waiting for the peer.
#[derive(Debug)]
pub struct CallbackStream {
    id: u32,
    mux: MuxConn,
    abandoned: CancellationToken,
}

impl CallbackStream {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Stop waiting for the peer and release the ID. A stream the peer has
    /// already opened keeps being served until it closes it.
    pub fn abandon(self) {
        self.abandoned.cancel();
        self.mux.forget_unopened(self.id);
    }

    /// Pass `result` through, abandoning the stream if it is an error.
    pub fn settle<T>(self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.abandon();
        }
        result
    }
}

/// Dial a stream the peer is serving and wrap it for calls.
pub async fn dial_client(mux: &MuxConn, id: u32) -> Result<RpcClient> {
    RpcClient::dial(mux, id).await
}

/// Serve `artifact` on a new stream, or return [`NO_STREAM`] for `None`.
pub(crate) fn serve_artifact(mux: &MuxConn, artifact: Option<Arc<dyn Artifact>>) -> Result<u32> {
    match artifact {
        Some(artifact) => {
            let services: Vec<Arc<dyn Service>> = vec![Arc::new(ArtifactServer::new(artifact))];
            Ok(serve_on_new_stream(mux, registry_for(services))?.id())
        }
        None => Ok(NO_STREAM),
    }
}

/// Dial the artifact served on `id`, if any.
pub(crate) async fn dial_artifact(mux: &MuxConn, id: u32) -> Result<Option<Arc<dyn Artifact>>> {
    if id == NO_STREAM {
        return Ok(None);
    }
    let rpc = dial_client(mux, id).await?;
    Ok(Some(Arc::new(ArtifactClient::new(rpc))))
}

/// Cancellation context shared by a server adapter's long-running method
/// and its `Cancel` handler.
///
/// Created on first use, so a `Cancel` that arrives before `Run` still
/// cancels it.
#[derive(Debug, Default)]
pub struct CancelSlot {
    token: Mutex<Option<CancellationToken>>,
}

impl CancelSlot {
    pub fn token(&self) -> CancellationToken {
        lock(&self.token)
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.token().cancel();
    }
}

/// Register `<endpoint>.<method>` as a handler that runs `f` on the service
/// and replies with its result.
pub(crate) fn expose<S, T, R, F, Fut>(
    registry: &mut HandlerRegistry,
    service: &Arc<S>,
    endpoint: Endpoint,
    method: &str,
    f: F,
) where
    S: Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Arc<S>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let service = service.clone();
    registry.register(&endpoint.method(method), move |args: T, ctx: RequestContext| {
        let work = f(service.clone(), args);
        async move {
            let body = MsgPackCodec::encode(&work.await?)?;
            ctx.respond_raw(body).await
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_method_names() {
        assert_eq!(Endpoint::PostProcessor.method("PostProcess"), "PostProcessor.PostProcess");
        assert_eq!(Endpoint::Ui.to_string(), "Ui");
    }

    #[test]
    fn test_config_spec_json() {
        let spec = ConfigSpec::from_json(&serde_json::json!({"region": "string"})).unwrap();
        assert_eq!(spec.to_json().unwrap()["region"], "string");
    }

    #[test]
    fn test_cancel_slot_before_token() {
        let slot = CancelSlot::default();
        slot.cancel();
        assert!(slot.token().is_cancelled());
        slot.cancel();
    }

    #[test]
    fn test_registry_for_services() {
        let ui: Arc<dyn Ui> = Arc::new(crate::testing::MockUi::default());
        let hook: Arc<dyn Hook> = Arc::new(crate::testing::MockHook::default());
        let services: Vec<Arc<dyn Service>> =
            vec![Arc::new(UiServer::new(ui)), Arc::new(HookServer::new(hook))];
        let registry = registry_for(services);
        assert_eq!(registry.endpoints(), vec!["Hook", "Ui"]);
        assert!(registry.contains("Ui.Machine"));
    }
}
