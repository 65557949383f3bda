use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    dial_client, expose, registry_for, serve_on_new_stream, CancelSlot, CommonClient,
    Communicator, CommunicatorClient, CommunicatorServer, ConfigSpec, Endpoint, Service, Ui,
    UiClient, UiServer,
};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::mux::MuxConn;
use crate::rpc::RpcClient;

/// Provisioners configure a running machine through a [`Communicator`].
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn config_spec(&self) -> Result<ConfigSpec>;

    async fn prepare(&self, configs: Vec<Value>) -> Result<()>;

    async fn provision(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        comm: Arc<dyn Communicator>,
        generated_data: HashMap<String, Value>,
    ) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ProvisionArgs {
    stream_id: u32,
    generated_data: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ProvisionerClient {
    common: CommonClient,
}

impl ProvisionerClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Provisioner, rpc),
        }
    }
}

#[async_trait]
impl Provisioner for ProvisionerClient {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.common.call("ConfigSpec", &()).await
    }

    async fn prepare(&self, configs: Vec<Value>) -> Result<()> {
        self.common.call("Prepare", &configs).await
    }

    async fn provision(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        comm: Arc<dyn Communicator>,
        generated_data: HashMap<String, Value>,
    ) -> Result<()> {
        let callbacks: Vec<Arc<dyn Service>> = vec![
            Arc::new(UiServer::new(ui)),
            Arc::new(CommunicatorServer::new(comm)),
        ];
        let callbacks = serve_on_new_stream(self.common.mux(), registry_for(callbacks))?;

        let args = ProvisionArgs {
            stream_id: callbacks.id(),
            generated_data,
        };
        let result = self.common.call_cancellable("Provision", &args, &ctx).await;
        callbacks.settle(result)
    }
}

pub struct ProvisionerServer {
    provisioner: Arc<dyn Provisioner>,
    mux: MuxConn,
    cancel: CancelSlot,
}

impl ProvisionerServer {
    pub fn new(provisioner: Arc<dyn Provisioner>, mux: MuxConn) -> Self {
        Self {
            provisioner,
            mux,
            cancel: CancelSlot::default(),
        }
    }

    async fn provision(&self, args: ProvisionArgs) -> Result<()> {
        let callbacks = dial_client(&self.mux, args.stream_id).await?;
        let ui: Arc<dyn Ui> = Arc::new(UiClient::new(callbacks.clone()));
        let comm: Arc<dyn Communicator> = Arc::new(CommunicatorClient::new(callbacks));

        self.provisioner
            .provision(self.cancel.token(), ui, comm, args.generated_data)
            .await
    }
}

impl Service for ProvisionerServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Provisioner
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let ep = Endpoint::Provisioner;
        expose(registry, &self, ep, "ConfigSpec", |s, _: ()| async move {
            s.provisioner.config_spec().await
        });
        expose(registry, &self, ep, "Prepare", |s, configs: Vec<Value>| async move {
            s.provisioner.prepare(configs).await
        });
        expose(registry, &self, ep, "Provision", |s, args: ProvisionArgs| async move {
            s.provision(args).await
        });
        expose(registry, &self, ep, "Cancel", |s, _: ()| async move {
            s.cancel.cancel();
            Ok(())
        });
    }
}
