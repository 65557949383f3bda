use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    dial_artifact, dial_client, expose, registry_for, serve_artifact, serve_on_new_stream,
    Artifact, ArtifactClient, ArtifactServer, CancelSlot, CommonClient, ConfigSpec, Endpoint,
    Service, Ui, UiClient, UiServer,
};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::mux::MuxConn;
use crate::rpc::RpcClient;

/// Result of [`PostProcessor::post_process`].
pub struct PostProcessOutput {
    pub artifact: Option<Arc<dyn Artifact>>,
    /// Keep the input artifact.
    pub keep: bool,
    /// Apply `keep` even if the user asked otherwise.
    pub force_override: bool,
}

impl std::fmt::Debug for PostProcessOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessOutput")
            .field("artifact", &self.artifact.is_some())
            .field("keep", &self.keep)
            .field("force_override", &self.force_override)
            .finish()
    }
}

/// Post-processors turn one artifact into another.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn config_spec(&self) -> Result<ConfigSpec>;

    async fn configure(&self, configs: Vec<Value>) -> Result<()>;

    async fn post_process(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
    ) -> Result<PostProcessOutput>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PostProcessReply {
    stream_id: u32,
    keep: bool,
    force_override: bool,
}

#[derive(Debug, Clone)]
pub struct PostProcessorClient {
    common: CommonClient,
}

impl PostProcessorClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::PostProcessor, rpc),
        }
    }
}

#[async_trait]
impl PostProcessor for PostProcessorClient {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.common.call("ConfigSpec", &()).await
    }

    async fn configure(&self, configs: Vec<Value>) -> Result<()> {
        self.common.call("Configure", &configs).await
    }

    async fn post_process(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
    ) -> Result<PostProcessOutput> {
        let mux = self.common.mux();
        let callbacks: Vec<Arc<dyn Service>> = vec![
            Arc::new(UiServer::new(ui)),
            Arc::new(ArtifactServer::new(artifact)),
        ];
        let callbacks = serve_on_new_stream(mux, registry_for(callbacks))?;

        let result = self
            .common
            .call_cancellable("PostProcess", &callbacks.id(), &ctx)
            .await;
        let reply: PostProcessReply = callbacks.settle(result)?;
        Ok(PostProcessOutput {
            artifact: dial_artifact(mux, reply.stream_id).await?,
            keep: reply.keep,
            force_override: reply.force_override,
        })
    }
}

pub struct PostProcessorServer {
    post_processor: Arc<dyn PostProcessor>,
    mux: MuxConn,
    cancel: CancelSlot,
}

impl PostProcessorServer {
    pub fn new(post_processor: Arc<dyn PostProcessor>, mux: MuxConn) -> Self {
        Self {
            post_processor,
            mux,
            cancel: CancelSlot::default(),
        }
    }

    async fn post_process(&self, stream_id: u32) -> Result<PostProcessReply> {
        let callbacks = dial_client(&self.mux, stream_id).await?;
        let ui: Arc<dyn Ui> = Arc::new(UiClient::new(callbacks.clone()));
        let input: Arc<dyn Artifact> = Arc::new(ArtifactClient::new(callbacks));

        let output = self
            .post_processor
            .post_process(self.cancel.token(), ui, input)
            .await?;
        Ok(PostProcessReply {
            stream_id: serve_artifact(&self.mux, output.artifact)?,
            keep: output.keep,
            force_override: output.force_override,
        })
    }
}

impl Service for PostProcessorServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::PostProcessor
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let ep = Endpoint::PostProcessor;
        expose(registry, &self, ep, "ConfigSpec", |s, _: ()| async move {
            s.post_processor.config_spec().await
        });
        expose(registry, &self, ep, "Configure", |s, configs: Vec<Value>| async move {
            s.post_processor.configure(configs).await
        });
        expose(registry, &self, ep, "PostProcess", |s, stream_id: u32| async move {
            s.post_process(stream_id).await
        });
        expose(registry, &self, ep, "Cancel", |s, _: ()| async move {
            s.cancel.cancel();
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_component, MockArtifact, MockPostProcessor, MockUi};

    #[tokio::test]
    async fn test_post_process_wraps_input_artifact() {
        let mock = Arc::new(MockPostProcessor::default());
        let rpc = serve_component(|mux| Arc::new(PostProcessorServer::new(mock, mux))).await.unwrap();
        let post_processor = PostProcessorClient::new(rpc);

        let ui = Arc::new(MockUi::default());
        let input = Arc::new(MockArtifact::new("ami-1"));
        let output = post_processor
            .post_process(CancellationToken::new(), ui.clone(), input)
            .await
            .unwrap();

        assert!(output.keep);
        assert!(!output.force_override);
        let artifact = output.artifact.expect("output artifact");
        assert_eq!(artifact.id().await.unwrap(), "ami-1.compressed");
        assert_eq!(ui.said(), vec!["compressing ami-1"]);
    }

    #[tokio::test]
    async fn test_post_process_without_output() {
        let mock = Arc::new(MockPostProcessor::discarding());
        let rpc = serve_component(|mux| Arc::new(PostProcessorServer::new(mock, mux))).await.unwrap();
        let post_processor = PostProcessorClient::new(rpc);

        let output = post_processor
            .post_process(
                CancellationToken::new(),
                Arc::new(MockUi::default()),
                Arc::new(MockArtifact::new("ami-2")),
            )
            .await
            .unwrap();
        assert!(output.artifact.is_none());
        assert!(!output.keep);
    }
}
