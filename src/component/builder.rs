//! Builders: the components that create machine images.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    dial_artifact, dial_client, expose, registry_for, serve_artifact, serve_on_new_stream,
    Artifact, CancelSlot, CommonClient, ConfigSpec, Endpoint, Hook, HookClient, HookServer,
    Service, Ui, UiClient, UiServer,
};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::mux::MuxConn;
use crate::rpc::RpcClient;

/// Result of [`Builder::prepare`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOutput {
    /// Names of variables the builder will generate during `run`.
    pub generated_vars: Vec<String>,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn config_spec(&self) -> Result<ConfigSpec>;

    async fn prepare(&self, configs: Vec<Value>) -> Result<PrepareOutput>;

    /// Run the build. `ui` and `hook` belong to the caller; `Ok(None)` means
    /// the build produced no artifact.
    async fn run(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<Arc<dyn Artifact>>>;
}

#[derive(Debug, Clone)]
pub struct BuilderClient {
    common: CommonClient,
}

impl BuilderClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Builder, rpc),
        }
    }
}

#[async_trait]
impl Builder for BuilderClient {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.common.call("ConfigSpec", &()).await
    }

    async fn prepare(&self, configs: Vec<Value>) -> Result<PrepareOutput> {
        self.common.call("Prepare", &configs).await
    }

    async fn run(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<Arc<dyn Artifact>>> {
        let mux = self.common.mux();
        let callbacks: Vec<Arc<dyn Service>> =
            vec![Arc::new(UiServer::new(ui)), Arc::new(HookServer::new(hook))];
        let callbacks = serve_on_new_stream(mux, registry_for(callbacks))?;

        let result = self.common.call_cancellable("Run", &callbacks.id(), &ctx).await;
        let response_id: u32 = callbacks.settle(result)?;
        dial_artifact(mux, response_id).await
    }
}

/// Server adapter exposing a local [`Builder`].
pub struct BuilderServer {
    builder: Arc<dyn Builder>,
    mux: MuxConn,
    cancel: CancelSlot,
}

impl BuilderServer {
    pub fn new(builder: Arc<dyn Builder>, mux: MuxConn) -> Self {
        Self {
            builder,
            mux,
            cancel: CancelSlot::default(),
        }
    }

    async fn run(&self, stream_id: u32) -> Result<u32> {
        let callbacks = dial_client(&self.mux, stream_id).await?;
        let ui: Arc<dyn Ui> = Arc::new(UiClient::new(callbacks.clone()));
        let hook: Arc<dyn Hook> = Arc::new(HookClient::new(callbacks));

        let artifact = self.builder.run(self.cancel.token(), ui, hook).await?;
        serve_artifact(&self.mux, artifact)
    }
}

impl Service for BuilderServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Builder
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let ep = Endpoint::Builder;
        expose(registry, &self, ep, "ConfigSpec", |s, _: ()| async move {
            s.builder.config_spec().await
        });
        expose(registry, &self, ep, "Prepare", |s, configs: Vec<Value>| async move {
            s.builder.prepare(configs).await
        });
        expose(registry, &self, ep, "Run", |s, stream_id: u32| async move { s.run(stream_id).await });
        expose(registry, &self, ep, "Cancel", |s, _: ()| async move {
            s.cancel.cancel();
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_component, MockBuilder, MockHook, MockUi};
    use std::time::Duration;

    async fn builder_pair(mock: Arc<MockBuilder>) -> BuilderClient {
        let rpc = serve_component(|mux| Arc::new(BuilderServer::new(mock, mux))).await.unwrap();
        BuilderClient::new(rpc)
    }

    #[tokio::test]
    async fn test_prepare_passes_configs() {
        let mock = Arc::new(MockBuilder::default());
        let builder = builder_pair(mock.clone()).await;

        let output = builder
            .prepare(vec![serde_json::json!({"region": "us-east-1"})])
            .await
            .unwrap();
        assert_eq!(output.generated_vars, vec!["MockVar"]);
        assert_eq!(mock.prepared()[0]["region"], "us-east-1");
    }

    #[tokio::test]
    async fn test_run_calls_back_and_returns_artifact() {
        let mock = Arc::new(MockBuilder::default());
        let builder = builder_pair(mock.clone()).await;
        let ui = Arc::new(MockUi::default());
        let hook = Arc::new(MockHook::default());

        let artifact = builder
            .run(CancellationToken::new(), ui.clone(), hook.clone())
            .await
            .unwrap()
            .expect("artifact");

        assert_eq!(artifact.id().await.unwrap(), "mock-artifact");
        assert_eq!(ui.said(), vec!["running"]);
        assert_eq!(hook.calls()[0].0, "buildplug_provision");
    }

    #[tokio::test]
    async fn test_run_without_artifact() {
        let mock = Arc::new(MockBuilder::without_artifact());
        let builder = builder_pair(mock).await;

        let artifact = builder
            .run(
                CancellationToken::new(),
                Arc::new(MockUi::default()),
                Arc::new(MockHook::default()),
            )
            .await
            .unwrap();
        assert!(artifact.is_none());
    }

    #[tokio::test]
    async fn test_run_error_is_remote() {
        let mock = Arc::new(MockBuilder::failing("quota exceeded"));
        let builder = builder_pair(mock).await;

        let err = builder
            .run(
                CancellationToken::new(),
                Arc::new(MockUi::default()),
                Arc::new(MockHook::default()),
            )
            .await
            .err()
            .expect("run should fail");
        assert_eq!(err.to_string(), "quota exceeded");
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_failed_run_releases_callback_stream() {
        use crate::component::DatasourceServer;
        use crate::testing::{serve_pair, MockDatasource};

        // The peer serves no builder, so every Run is rejected before it
        // could dial the callback stream.
        let services: Vec<Arc<dyn Service>> = vec![Arc::new(DatasourceServer::new(Arc::new(
            MockDatasource::default(),
        )))];
        let rpc = serve_pair(services).await.unwrap();
        let mux = rpc.mux().clone();
        let builder = BuilderClient::new(rpc);

        for _ in 0..5 {
            let result = builder
                .run(
                    CancellationToken::new(),
                    Arc::new(MockUi::default()),
                    Arc::new(MockHook::default()),
                )
                .await;
            assert!(result.is_err());
        }
        assert_eq!(mux.open_streams(), 1);
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_build() {
        let mock = Arc::new(MockBuilder::blocking());
        let builder = builder_pair(mock.clone()).await;
        let ctx = CancellationToken::new();

        let run = {
            let builder = builder.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                builder
                    .run(ctx, Arc::new(MockUi::default()), Arc::new(MockHook::default()))
                    .await
            })
        };

        mock.wait_until_running().await;
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not observe cancellation")
            .unwrap();
        let err = result.err().expect("cancelled run fails");
        assert_eq!(err.to_string(), "build cancelled");
        assert!(mock.was_cancelled());
    }

    #[tokio::test]
    async fn test_no_cancel_after_completion() {
        let mock = Arc::new(MockBuilder::default());
        let builder = builder_pair(mock.clone()).await;
        let ctx = CancellationToken::new();

        builder
            .run(
                ctx.clone(),
                Arc::new(MockUi::default()),
                Arc::new(MockHook::default()),
            )
            .await
            .unwrap();
        ctx.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!mock.was_cancelled());
    }
}
