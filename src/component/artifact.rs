//! Build results.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{expose, CommonClient, Endpoint, Service};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::rpc::RpcClient;

/// The output of a builder or post-processor.
#[async_trait]
pub trait Artifact: Send + Sync {
    /// ID of the builder that produced this artifact.
    async fn builder_id(&self) -> Result<String>;
    async fn files(&self) -> Result<Vec<String>>;
    async fn id(&self) -> Result<String>;
    /// Human-readable description.
    async fn string(&self) -> Result<String>;
    /// Builder-specific state by name; `Null` when unknown.
    async fn state(&self, name: &str) -> Result<Value>;
    async fn destroy(&self) -> Result<()>;
}

/// Client proxy for an artifact served on its own stream.
///
/// Dropping the last clone closes the stream, which ends the remote
/// registration.
#[derive(Debug, Clone)]
pub struct ArtifactClient {
    common: CommonClient,
}

impl ArtifactClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Artifact, rpc),
        }
    }

    /// Stream the artifact is served on.
    pub fn stream_id(&self) -> u32 {
        self.common.rpc().stream_id()
    }
}

#[async_trait]
impl Artifact for ArtifactClient {
    async fn builder_id(&self) -> Result<String> {
        self.common.call("BuilderId", &()).await
    }

    async fn files(&self) -> Result<Vec<String>> {
        self.common.call("Files", &()).await
    }

    async fn id(&self) -> Result<String> {
        self.common.call("Id", &()).await
    }

    async fn string(&self) -> Result<String> {
        self.common.call("String", &()).await
    }

    async fn state(&self, name: &str) -> Result<Value> {
        self.common.call("State", name).await
    }

    async fn destroy(&self) -> Result<()> {
        self.common.call("Destroy", &()).await
    }
}

pub struct ArtifactServer {
    artifact: Arc<dyn Artifact>,
}

impl ArtifactServer {
    pub fn new(artifact: Arc<dyn Artifact>) -> Self {
        Self { artifact }
    }
}

impl Service for ArtifactServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Artifact
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let ep = Endpoint::Artifact;
        expose(registry, &self, ep, "BuilderId", |s, _: ()| async move {
            s.artifact.builder_id().await
        });
        expose(registry, &self, ep, "Files", |s, _: ()| async move { s.artifact.files().await });
        expose(registry, &self, ep, "Id", |s, _: ()| async move { s.artifact.id().await });
        expose(registry, &self, ep, "String", |s, _: ()| async move { s.artifact.string().await });
        expose(registry, &self, ep, "State", |s, name: String| async move {
            s.artifact.state(&name).await
        });
        expose(registry, &self, ep, "Destroy", |s, _: ()| async move { s.artifact.destroy().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_pair, MockArtifact};

    #[tokio::test]
    async fn test_artifact_accessors() {
        let mock = Arc::new(MockArtifact::new("ami-123").with_state("region", "eu-west-1"));
        let artifact =
            ArtifactClient::new(serve_pair(vec![Arc::new(ArtifactServer::new(mock.clone()))]).await.unwrap());

        assert_eq!(artifact.id().await.unwrap(), "ami-123");
        assert_eq!(artifact.builder_id().await.unwrap(), "buildplug.mock");
        assert_eq!(artifact.files().await.unwrap(), vec!["ami-123.img"]);
        assert_eq!(artifact.state("region").await.unwrap(), "eu-west-1");
        assert_eq!(artifact.state("nope").await.unwrap(), Value::Null);

        artifact.destroy().await.unwrap();
        assert!(mock.destroyed());
    }
}
