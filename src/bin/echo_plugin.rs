//! Demo plugin binary.
//!
//! `buildplug-echo-plugin describe` prints the component list;
//! `buildplug-echo-plugin start builder default` serves a builder that greets
//! the caller's UI with "hello" and returns an artifact with ID "x".
//!
//! Logs go to stderr so stdout carries only the handshake line and
//! `describe` output.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use buildplug::component::{Artifact, Builder, ConfigSpec, Hook, PrepareOutput, Ui};
use buildplug::server::{PluginSet, DEFAULT_COMPONENT};
use buildplug::testing::{MockArtifact, MockBuilder, MockDatasource, MockProvisioner};
use buildplug::Result;

#[derive(Debug, Default)]
struct EchoBuilder;

#[async_trait]
impl Builder for EchoBuilder {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        ConfigSpec::from_json(&json!({ "greeting": "string" }))
    }

    async fn prepare(&self, _configs: Vec<Value>) -> Result<PrepareOutput> {
        Ok(PrepareOutput::default())
    }

    async fn run(
        &self,
        _ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        _hook: Arc<dyn Hook>,
    ) -> Result<Option<Arc<dyn Artifact>>> {
        ui.say("hello").await?;
        Ok(Some(Arc::new(MockArtifact::new("x"))))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let mut set = PluginSet::new(env!("CARGO_PKG_VERSION"));
    set.register_builder(DEFAULT_COMPONENT, Arc::new(EchoBuilder))
        .register_builder("blocking", Arc::new(MockBuilder::blocking()))
        .register_provisioner("shell", Arc::new(MockProvisioner::new("echo provisioned")))
        .register_datasource("static", Arc::new(MockDatasource::default()));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = set.run(&args).await {
        error!(error = %e, "plugin failed");
        eprintln!("{e}");
        std::process::exit(1);
    }
}
