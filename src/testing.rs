//! Test helpers: in-memory connections and mock components.
//!
//! The mocks record what they were asked to do so tests on either side of
//! a connection can assert on it. They are also used by the demo plugin
//! binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::duplex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::component::{
    registry_for, Artifact, Builder, CommandOutput, Communicator, ConfigSpec, Datasource, Hook,
    PostProcessOutput, PostProcessor, PrepareOutput, Provisioner, RemoteCmd, Service, Ui,
};
use crate::error::{PluginError, Result};
use crate::handler::HandlerRegistry;
use crate::mux::{lock, MuxConfig, MuxConn, Role};
use crate::rpc::{RpcClient, RpcServer};

/// Capacity of the in-memory pipe behind [`connected_pair`].
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Two multiplexed connections joined by an in-memory pipe.
///
/// The first plays the orchestrator (odd stream IDs), the second the plugin
/// (even stream IDs).
pub fn connected_pair() -> (MuxConn, MuxConn) {
    let (a, b) = duplex(PIPE_CAPACITY);
    (
        MuxConn::new(a, Role::Client, MuxConfig::default()),
        MuxConn::new(b, Role::Server, MuxConfig::default()),
    )
}

/// Serve `services` on stream 0 of a fresh pair and return a client for it.
pub async fn serve_pair(services: Vec<Arc<dyn Service>>) -> Result<RpcClient> {
    serve_registry(registry_for(services)).await
}

/// Like [`serve_pair`] for a server adapter that needs the plugin-side
/// connection (to dial callbacks and serve artifacts).
pub async fn serve_component<S, F>(make: F) -> Result<RpcClient>
where
    S: Service,
    F: FnOnce(MuxConn) -> Arc<S>,
{
    let (client, server) = connected_pair();
    let mut registry = HandlerRegistry::new();
    make(server.clone()).register(&mut registry);
    spawn_primary(server, registry);
    RpcClient::dial(&client, 0).await
}

async fn serve_registry(registry: HandlerRegistry) -> Result<RpcClient> {
    let (client, server) = connected_pair();
    spawn_primary(server, registry);
    RpcClient::dial(&client, 0).await
}

fn spawn_primary(server: MuxConn, registry: HandlerRegistry) {
    tokio::spawn(async move {
        let stream = server.accept(0).await?;
        RpcServer::new(registry).serve(stream).await
    });
}

fn mock_spec() -> Result<ConfigSpec> {
    ConfigSpec::from_json(&json!({ "region": "string" }))
}

/// Records everything said to it; answers every question with a fixed
/// string.
#[derive(Debug, Default)]
pub struct MockUi {
    answer: String,
    said: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    machine: Mutex<Vec<String>>,
}

impl MockUi {
    pub fn with_answer(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            ..Self::default()
        }
    }

    pub fn said(&self) -> Vec<String> {
        lock(&self.said).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    /// Machine lines as `kind,arg,arg`.
    pub fn machine_lines(&self) -> Vec<String> {
        lock(&self.machine).clone()
    }
}

#[async_trait]
impl Ui for MockUi {
    async fn ask(&self, _query: &str) -> Result<String> {
        Ok(self.answer.clone())
    }

    async fn say(&self, message: &str) -> Result<()> {
        lock(&self.said).push(message.to_string());
        Ok(())
    }

    async fn message(&self, message: &str) -> Result<()> {
        lock(&self.messages).push(message.to_string());
        Ok(())
    }

    async fn error(&self, message: &str) -> Result<()> {
        lock(&self.errors).push(message.to_string());
        Ok(())
    }

    async fn machine(&self, kind: &str, args: &[String]) -> Result<()> {
        let mut line = vec![kind.to_string()];
        line.extend(args.iter().cloned());
        lock(&self.machine).push(line.join(","));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockHook {
    fail_with: Option<String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockHook {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Hook for MockHook {
    async fn run(&self, name: &str, data: Value) -> Result<()> {
        lock(&self.calls).push((name.to_string(), data));
        match &self.fail_with {
            Some(message) => Err(PluginError::Remote(message.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct MockArtifact {
    id: String,
    state: HashMap<String, Value>,
    destroyed: AtomicBool,
}

impl MockArtifact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: HashMap::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_state(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.state.insert(name.to_string(), value.into());
        self
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Artifact for MockArtifact {
    async fn builder_id(&self) -> Result<String> {
        Ok("buildplug.mock".to_string())
    }

    async fn files(&self) -> Result<Vec<String>> {
        Ok(vec![format!("{}.img", self.id)])
    }

    async fn id(&self) -> Result<String> {
        Ok(self.id.clone())
    }

    async fn string(&self) -> Result<String> {
        Ok(format!("mock artifact {}", self.id))
    }

    async fn state(&self, name: &str) -> Result<Value> {
        Ok(self.state.get(name).cloned().unwrap_or(Value::Null))
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Runs commands by echoing them back; keeps uploaded files in memory.
#[derive(Debug, Default)]
pub struct MockCommunicator {
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    dir_transfers: Mutex<Vec<String>>,
}

impl MockCommunicator {
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn dir_transfers(&self) -> Vec<String> {
        lock(&self.dir_transfers).clone()
    }
}

#[async_trait]
impl Communicator for MockCommunicator {
    async fn start(&self, cmd: RemoteCmd) -> Result<CommandOutput> {
        lock(&self.commands).push(cmd.command.clone());
        Ok(CommandOutput {
            exit_status: 0,
            stdout: cmd.command.into_bytes(),
            stderr: Vec::new(),
        })
    }

    async fn upload(&self, path: &str, data: Vec<u8>, _mode: Option<u32>) -> Result<()> {
        lock(&self.files).insert(path.to_string(), data);
        Ok(())
    }

    async fn upload_dir(&self, dst: &str, src: &str, exclude: &[String]) -> Result<()> {
        let mut line = format!("upload {src} -> {dst}");
        if !exclude.is_empty() {
            line.push_str(&format!(" (excluding {})", exclude.join(", ")));
        }
        lock(&self.dir_transfers).push(line);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| PluginError::Remote(format!("{path}: no such file")))
    }

    async fn download_dir(&self, src: &str, dst: &str, exclude: &[String]) -> Result<()> {
        let mut line = format!("download {src} -> {dst}");
        if !exclude.is_empty() {
            line.push_str(&format!(" (excluding {})", exclude.join(", ")));
        }
        lock(&self.dir_transfers).push(line);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum BuildOutcome {
    Artifact,
    NoArtifact,
    Fail(String),
    /// Wait for cancellation, then fail.
    Block,
}

/// Says `running`, fires the `buildplug_provision` hook, then finishes
/// according to how it was constructed.
#[derive(Debug)]
pub struct MockBuilder {
    outcome: BuildOutcome,
    prepared: Mutex<Vec<Value>>,
    run_ctx: Mutex<Option<CancellationToken>>,
    running: Notify,
}

impl Default for MockBuilder {
    fn default() -> Self {
        Self::with_outcome(BuildOutcome::Artifact)
    }
}

impl MockBuilder {
    fn with_outcome(outcome: BuildOutcome) -> Self {
        Self {
            outcome,
            prepared: Mutex::new(Vec::new()),
            run_ctx: Mutex::new(None),
            running: Notify::new(),
        }
    }

    pub fn without_artifact() -> Self {
        Self::with_outcome(BuildOutcome::NoArtifact)
    }

    pub fn failing(message: &str) -> Self {
        Self::with_outcome(BuildOutcome::Fail(message.to_string()))
    }

    /// A builder whose `run` only returns once cancelled.
    pub fn blocking() -> Self {
        Self::with_outcome(BuildOutcome::Block)
    }

    pub fn prepared(&self) -> Vec<Value> {
        lock(&self.prepared).clone()
    }

    /// Wait until `run` has started (and for [`blocking`](Self::blocking),
    /// is waiting on its context).
    pub async fn wait_until_running(&self) {
        self.running.notified().await
    }

    /// True if the context handed to `run` was cancelled.
    pub fn was_cancelled(&self) -> bool {
        lock(&self.run_ctx)
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Builder for MockBuilder {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        mock_spec()
    }

    async fn prepare(&self, configs: Vec<Value>) -> Result<PrepareOutput> {
        lock(&self.prepared).extend(configs);
        Ok(PrepareOutput {
            generated_vars: vec!["MockVar".to_string()],
            warnings: Vec::new(),
        })
    }

    async fn run(
        &self,
        ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<Arc<dyn Artifact>>> {
        *lock(&self.run_ctx) = Some(ctx.clone());
        ui.say("running").await?;
        hook.run("buildplug_provision", json!({})).await?;
        self.running.notify_one();

        match &self.outcome {
            BuildOutcome::Artifact => Ok(Some(Arc::new(MockArtifact::new("mock-artifact")))),
            BuildOutcome::NoArtifact => Ok(None),
            BuildOutcome::Fail(message) => Err(PluginError::Remote(message.clone())),
            BuildOutcome::Block => {
                ctx.cancelled().await;
                Err(PluginError::Remote("build cancelled".to_string()))
            }
        }
    }
}

/// Runs one command through the communicator and reports the `ID` from the
/// generated data.
#[derive(Debug)]
pub struct MockProvisioner {
    command: String,
    reject_prepare: Option<String>,
}

impl MockProvisioner {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            reject_prepare: None,
        }
    }

    pub fn reject_prepare(mut self, message: &str) -> Self {
        self.reject_prepare = Some(message.to_string());
        self
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        mock_spec()
    }

    async fn prepare(&self, _configs: Vec<Value>) -> Result<()> {
        match &self.reject_prepare {
            Some(message) => Err(PluginError::Remote(message.clone())),
            None => Ok(()),
        }
    }

    async fn provision(
        &self,
        _ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        comm: Arc<dyn Communicator>,
        generated_data: HashMap<String, Value>,
    ) -> Result<()> {
        let id = generated_data
            .get("ID")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        ui.say(&format!("provisioning {id}")).await?;

        let output = comm.start(RemoteCmd::new(self.command.clone())).await?;
        if output.exit_status != 0 {
            return Err(PluginError::Remote(format!(
                "{} exited with {}",
                self.command, output.exit_status
            )));
        }
        Ok(())
    }
}

/// Wraps the input artifact as `<id>.compressed`, or discards it.
#[derive(Debug, Default)]
pub struct MockPostProcessor {
    discard: bool,
}

impl MockPostProcessor {
    pub fn discarding() -> Self {
        Self { discard: true }
    }
}

#[async_trait]
impl PostProcessor for MockPostProcessor {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        mock_spec()
    }

    async fn configure(&self, _configs: Vec<Value>) -> Result<()> {
        Ok(())
    }

    async fn post_process(
        &self,
        _ctx: CancellationToken,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
    ) -> Result<PostProcessOutput> {
        if self.discard {
            return Ok(PostProcessOutput {
                artifact: None,
                keep: false,
                force_override: false,
            });
        }

        let id = artifact.id().await?;
        ui.say(&format!("compressing {id}")).await?;
        Ok(PostProcessOutput {
            artifact: Some(Arc::new(MockArtifact::new(format!("{id}.compressed")))),
            keep: true,
            force_override: false,
        })
    }
}

/// Returns its (first) configuration as the executed value.
#[derive(Debug, Default)]
pub struct MockDatasource {
    config: Mutex<Value>,
}

#[async_trait]
impl Datasource for MockDatasource {
    async fn config_spec(&self) -> Result<ConfigSpec> {
        ConfigSpec::from_json(&json!({ "channel": "string" }))
    }

    async fn configure(&self, configs: Vec<Value>) -> Result<()> {
        if let Some(first) = configs.into_iter().next() {
            *lock(&self.config) = first;
        }
        Ok(())
    }

    async fn output_spec(&self) -> Result<ConfigSpec> {
        ConfigSpec::from_json(&json!({ "channel": "string" }))
    }

    async fn execute(&self) -> Result<Value> {
        Ok(lock(&self.config).clone())
    }
}
