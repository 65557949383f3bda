use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{expose, CommonClient, Endpoint, Service};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::rpc::RpcClient;

/// Named hook the orchestrator lets components fire during a build
/// (for example `buildplug_provision`).
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, name: &str, data: Value) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct HookRunArgs {
    name: String,
    data: Value,
}

#[derive(Debug, Clone)]
pub struct HookClient {
    common: CommonClient,
}

impl HookClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Hook, rpc),
        }
    }
}

#[async_trait]
impl Hook for HookClient {
    async fn run(&self, name: &str, data: Value) -> Result<()> {
        let args = HookRunArgs {
            name: name.to_string(),
            data,
        };
        self.common.call("Run", &args).await
    }
}

pub struct HookServer {
    hook: Arc<dyn Hook>,
}

impl HookServer {
    pub fn new(hook: Arc<dyn Hook>) -> Self {
        Self { hook }
    }
}

impl Service for HookServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Hook
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        expose(registry, &self, Endpoint::Hook, "Run", |s, args: HookRunArgs| async move {
            s.hook.run(&args.name, args.data).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_pair, MockHook};

    #[tokio::test]
    async fn test_hook_run_forwards_name_and_data() {
        let mock = Arc::new(MockHook::default());
        let hook = HookClient::new(serve_pair(vec![Arc::new(HookServer::new(mock.clone()))]).await.unwrap());

        hook.run("buildplug_provision", serde_json::json!({"host": "10.0.0.1"}))
            .await
            .unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "buildplug_provision");
        assert_eq!(calls[0].1["host"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_hook_error_is_verbatim() {
        let mock = Arc::new(MockHook::failing("hook exploded"));
        let hook = HookClient::new(serve_pair(vec![Arc::new(HookServer::new(mock))]).await.unwrap());

        let err = hook.run("x", Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "hook exploded");
    }
}
