//! Orchestrator-facing component wrappers.
//!
//! Each `Cmd*` type wraps a client proxy for a component living in a plugin
//! process and routes every result through the plugin's [`ExitMonitor`], so
//! callers see transport failures already classified as fatal or expected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::ExitMonitor;
use crate::component::{
    Artifact, Builder, Communicator, ConfigSpec, Datasource, Hook, PostProcessOutput,
    PostProcessor, PrepareOutput, Provisioner, Ui,
};
use crate::error::Result;

fn wrap_artifact(
    artifact: Option<Arc<dyn Artifact>>,
    monitor: &ExitMonitor,
) -> Option<Arc<dyn Artifact>> {
    artifact.map(|inner| Arc::new(CmdArtifact::new(inner, monitor.clone())) as Arc<dyn Artifact>)
}

pub struct CmdBuilder {
    inner: Arc<dyn Builder>,
    monitor: ExitMonitor,
}

impl CmdBuilder {
    pub fn new(inner: Arc<dyn Builder>, monitor: ExitMonitor) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl Builder for CmdBuilder {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.monitor
            .check("Builder.ConfigSpec", self.inner.config_spec().await)
    }

    async fn prepare(&self, configs: Vec<Value>) -> Result<PrepareOutput> {
        self.monitor
            .check("Builder.Prepare", self.inner.prepare(configs).await)
    }

    async fn run(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<Arc<dyn Artifact>>> {
        let artifact = self
            .monitor
            .check("Builder.Run", self.inner.run(ctx, ui, hook).await)?;
        Ok(wrap_artifact(artifact, &self.monitor))
    }
}

pub struct CmdProvisioner {
    inner: Arc<dyn Provisioner>,
    monitor: ExitMonitor,
}

impl CmdProvisioner {
    pub fn new(inner: Arc<dyn Provisioner>, monitor: ExitMonitor) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl Provisioner for CmdProvisioner {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.monitor
            .check("Provisioner.ConfigSpec", self.inner.config_spec().await)
    }

    async fn prepare(&self, configs: Vec<Value>) -> Result<()> {
        self.monitor
            .check("Provisioner.Prepare", self.inner.prepare(configs).await)
    }

    async fn provision(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        comm: Arc<dyn Communicator>,
        generated_data: HashMap<String, Value>,
    ) -> Result<()> {
        let result = self.inner.provision(ctx, ui, comm, generated_data).await;
        self.monitor.check("Provisioner.Provision", result)
    }
}

pub struct CmdPostProcessor {
    inner: Arc<dyn PostProcessor>,
    monitor: ExitMonitor,
}

impl CmdPostProcessor {
    pub fn new(inner: Arc<dyn PostProcessor>, monitor: ExitMonitor) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl PostProcessor for CmdPostProcessor {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.monitor
            .check("PostProcessor.ConfigSpec", self.inner.config_spec().await)
    }

    async fn configure(&self, configs: Vec<Value>) -> Result<()> {
        self.monitor
            .check("PostProcessor.Configure", self.inner.configure(configs).await)
    }

    async fn post_process(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
    ) -> Result<PostProcessOutput> {
        let result = self.inner.post_process(ctx, ui, artifact).await;
        let mut output = self.monitor.check("PostProcessor.PostProcess", result)?;
        output.artifact = wrap_artifact(output.artifact.take(), &self.monitor);
        Ok(output)
    }
}

pub struct CmdDatasource {
    inner: Arc<dyn Datasource>,
    monitor: ExitMonitor,
}

impl CmdDatasource {
    pub fn new(inner: Arc<dyn Datasource>, monitor: ExitMonitor) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl Datasource for CmdDatasource {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        self.monitor
            .check("Datasource.ConfigSpec", self.inner.config_spec().await)
    }

    async fn configure(&self, configs: Vec<Value>) -> Result<()> {
        self.monitor
            .check("Datasource.Configure", self.inner.configure(configs).await)
    }

    async fn output_spec(&self) -> Result<ConfigSpec> {
        self.monitor
            .check("Datasource.OutputSpec", self.inner.output_spec().await)
    }

    async fn execute(&self) -> Result<Value> {
        self.monitor
            .check("Datasource.Execute", self.inner.execute().await)
    }
}

pub struct CmdHook {
    inner: Arc<dyn Hook>,
    monitor: ExitMonitor,
}

impl CmdHook {
    pub fn new(inner: Arc<dyn Hook>, monitor: ExitMonitor) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl Hook for CmdHook {
    async fn run(&self, name: &str, data: Value) -> Result<()> {
        self.monitor.check("Hook.Run", self.inner.run(name, data).await)
    }
}

/// Artifact produced by a plugin. Stays bound to that plugin's exit policy.
pub struct CmdArtifact {
    inner: Arc<dyn Artifact>,
    monitor: ExitMonitor,
}

impl CmdArtifact {
    pub fn new(inner: Arc<dyn Artifact>, monitor: ExitMonitor) -> Self {
        Self { inner, monitor }
    }
}

#[async_trait]
impl Artifact for CmdArtifact {
    async fn builder_id(&self) -> Result<String> {
        self.monitor
            .check("Artifact.BuilderId", self.inner.builder_id().await)
    }

    async fn files(&self) -> Result<Vec<String>> {
        self.monitor.check("Artifact.Files", self.inner.files().await)
    }

    async fn id(&self) -> Result<String> {
        self.monitor.check("Artifact.Id", self.inner.id().await)
    }

    async fn string(&self) -> Result<String> {
        self.monitor.check("Artifact.String", self.inner.string().await)
    }

    async fn state(&self, name: &str) -> Result<Value> {
        self.monitor.check("Artifact.State", self.inner.state(name).await)
    }

    async fn destroy(&self) -> Result<()> {
        self.monitor.check("Artifact.Destroy", self.inner.destroy().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ShutdownCoordinator;
    use crate::component::{BuilderClient, BuilderServer, HookClient, HookServer};
    use crate::error::PluginError;
    use crate::handler::{HandlerRegistry, RequestContext};
    use crate::rpc::{RpcClient, RpcServer};
    use crate::testing::{connected_pair, serve_component, MockBuilder, MockHook, MockUi};
    use serde::de::IgnoredAny;
    use tokio::sync::watch;

    fn monitor() -> (ExitMonitor, Arc<ShutdownCoordinator>, watch::Sender<bool>) {
        let coordinator = ShutdownCoordinator::new();
        let (tx, rx) = watch::channel(false);
        (ExitMonitor::new("test", rx, coordinator.clone()), coordinator, tx)
    }

    #[tokio::test]
    async fn test_run_artifact_stays_monitored() {
        let rpc = serve_component(|mux| {
            Arc::new(BuilderServer::new(Arc::new(MockBuilder::default()), mux))
        })
        .await
        .unwrap();
        let (monitor, _, _tx) = monitor();
        let builder = CmdBuilder::new(Arc::new(BuilderClient::new(rpc.clone())), monitor);

        let artifact = builder
            .run(
                CancellationToken::new(),
                Arc::new(MockUi::default()),
                Arc::new(MockHook::default()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.id().await.unwrap(), "mock-artifact");

        rpc.mux().close();
        let err = artifact.id().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Artifact.Id"));
    }

    #[tokio::test]
    async fn test_remote_error_passes_through() {
        let rpc = serve_component(|_mux| Arc::new(HookServer::new(Arc::new(MockHook::failing("no such hook")))))
            .await
            .unwrap();
        let (monitor, _, _tx) = monitor();
        let hook = CmdHook::new(Arc::new(HookClient::new(rpc)), monitor);

        let err = hook.run("buildplug_provision", Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "Hook.Run: no such hook");
        assert!(matches!(err.root(), PluginError::Remote(_)));
    }

    /// A hook endpoint whose `Run` replies with a body of the wrong type.
    async fn garbled_hook() -> HookClient {
        let (client, server) = connected_pair();
        let mut registry = HandlerRegistry::new();
        registry.register("Hook.Run", |_: IgnoredAny, ctx: RequestContext| async move {
            ctx.respond("not a unit").await
        });
        tokio::spawn(async move {
            let stream = server.accept(0).await?;
            RpcServer::new(registry).serve(stream).await
        });
        HookClient::new(RpcClient::dial(&client, 0).await.unwrap())
    }

    #[tokio::test]
    async fn test_decode_failure_is_fatal_while_running() {
        let (monitor, coordinator, _tx) = monitor();
        let hook = CmdHook::new(Arc::new(garbled_hook().await), monitor);

        let err = hook.run("h", Value::Null).await.unwrap_err();
        assert!(err.is_fatal());
        let message = err.to_string();
        assert!(message.contains("Hook.Run: MsgPack decode error"), "{message}");

        coordinator.begin_shutdown();
        let err = hook.run("h", Value::Null).await.unwrap_err();
        assert!(err.is_transport());
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_connection_loss_during_shutdown_absorbed() {
        let rpc = serve_component(|_mux| Arc::new(HookServer::new(Arc::new(MockHook::default()))))
            .await
            .unwrap();
        let (monitor, coordinator, _tx) = monitor();
        let hook = CmdHook::new(Arc::new(HookClient::new(rpc.clone())), monitor);

        coordinator.begin_shutdown();
        rpc.mux().close();
        let err = hook.run("h", Value::Null).await.unwrap_err();
        assert!(err.is_transport());
        assert!(!err.is_fatal());
    }
}
