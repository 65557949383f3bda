use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{expose, CommonClient, ConfigSpec, Endpoint, Service};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::rpc::RpcClient;

/// Data sources fetch values used while evaluating a build template.
#[async_trait]
pub trait Datasource: Send + Sync {
    async fn config_spec(&self) -> Result<ConfigSpec>;
    async fn configure(&self, configs: Vec<Value>) -> Result<()>;
    /// Schema of the value returned by [`execute`](Self::execute).
    async fn output_spec(&self) -> Result<ConfigSpec>;
    async fn execute(&self) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct DatasourceClient {
    common: CommonClient,
}

impl DatasourceClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Datasource, rpc),
        }
    }
}

#[async_trait]
impl Datasource for DatasourceClient {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.common.call("ConfigSpec", &()).await
    }

    async fn configure(&self, configs: Vec<Value>) -> Result<()> {
        self.common.call("Configure", &configs).await
    }

    async fn output_spec(&self) -> Result<ConfigSpec> {
        self.common.call("OutputSpec", &()).await
    }

    async fn execute(&self) -> Result<Value> {
        self.common.call("Execute", &()).await
    }
}

pub struct DatasourceServer {
    datasource: Arc<dyn Datasource>,
}

impl DatasourceServer {
    pub fn new(datasource: Arc<dyn Datasource>) -> Self {
        Self { datasource }
    }
}

impl Service for DatasourceServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Datasource
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let ep = Endpoint::Datasource;
        expose(registry, &self, ep, "ConfigSpec", |s, _: ()| async move {
            s.datasource.config_spec().await
        });
        expose(registry, &self, ep, "Configure", |s, configs: Vec<Value>| async move {
            s.datasource.configure(configs).await
        });
        expose(registry, &self, ep, "OutputSpec", |s, _: ()| async move {
            s.datasource.output_spec().await
        });
        expose(registry, &self, ep, "Execute", |s, _: ()| async move { s.datasource.execute().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_pair, MockDatasource};

    #[tokio::test]
    async fn test_configure_then_execute() {
        let mock = Arc::new(MockDatasource::default());
        let datasource =
            DatasourceClient::new(serve_pair(vec![Arc::new(DatasourceServer::new(mock))]).await.unwrap());

        datasource
            .configure(vec![serde_json::json!({"channel": "stable"})])
            .await
            .unwrap();
        let value = datasource.execute().await.unwrap();
        assert_eq!(value["channel"], "stable");

        let spec = datasource.output_spec().await.unwrap().to_json().unwrap();
        assert_eq!(spec["channel"], "string");
    }
}
