//! User interface callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{expose, CommonClient, Endpoint, Service};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::rpc::RpcClient;

/// Output and prompting surface the orchestrator hands to components.
#[async_trait]
pub trait Ui: Send + Sync {
    async fn ask(&self, query: &str) -> Result<String>;
    async fn say(&self, message: &str) -> Result<()>;
    async fn message(&self, message: &str) -> Result<()>;
    async fn error(&self, message: &str) -> Result<()>;
    /// Machine-readable output line.
    async fn machine(&self, kind: &str, args: &[String]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct MachineArgs {
    kind: String,
    args: Vec<String>,
}

/// Client proxy for a remote [`Ui`].
#[derive(Debug, Clone)]
pub struct UiClient {
    common: CommonClient,
}

impl UiClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Ui, rpc),
        }
    }
}

#[async_trait]
impl Ui for UiClient {
    async fn ask(&self, query: &str) -> Result<String> {
        self.common.call("Ask", query).await
    }

    async fn say(&self, message: &str) -> Result<()> {
        self.common.call("Say", message).await
    }

    async fn message(&self, message: &str) -> Result<()> {
        self.common.call("Message", message).await
    }

    async fn error(&self, message: &str) -> Result<()> {
        self.common.call("Error", message).await
    }

    async fn machine(&self, kind: &str, args: &[String]) -> Result<()> {
        let args = MachineArgs {
            kind: kind.to_string(),
            args: args.to_vec(),
        };
        self.common.call("Machine", &args).await
    }
}

/// Server adapter exposing a local [`Ui`].
pub struct UiServer {
    ui: Arc<dyn Ui>,
}

impl UiServer {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }
}

impl Service for UiServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Ui
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        expose(registry, &self, Endpoint::Ui, "Ask", |s, query: String| async move {
            s.ui.ask(&query).await
        });
        expose(registry, &self, Endpoint::Ui, "Say", |s, message: String| async move {
            s.ui.say(&message).await
        });
        expose(registry, &self, Endpoint::Ui, "Message", |s, message: String| async move {
            s.ui.message(&message).await
        });
        expose(registry, &self, Endpoint::Ui, "Error", |s, message: String| async move {
            s.ui.error(&message).await
        });
        expose(registry, &self, Endpoint::Ui, "Machine", |s, args: MachineArgs| async move {
            s.ui.machine(&args.kind, &args.args).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_pair, MockUi};

    #[tokio::test]
    async fn test_ui_round_trip() {
        let mock = Arc::new(MockUi::with_answer("yes"));
        let ui = UiClient::new(serve_pair(vec![Arc::new(UiServer::new(mock.clone()))]).await.unwrap());

        assert_eq!(ui.ask("continue?").await.unwrap(), "yes");
        ui.say("hello").await.unwrap();
        ui.error("oops").await.unwrap();
        ui.machine("artifact", &["0".into(), "id".into()]).await.unwrap();

        assert_eq!(mock.said(), vec!["hello"]);
        assert_eq!(mock.errors(), vec!["oops"]);
        assert_eq!(mock.machine_lines(), vec!["artifact,0,id"]);
    }
}
