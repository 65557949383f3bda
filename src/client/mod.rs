//! Orchestrator side: launching and talking to plugin processes.
//!
//! A [`PluginClient`] owns one plugin process. [`start`](PluginClient::start)
//! spawns it and reads the handshake line,
//! [`client`](PluginClient::client) dials the advertised address, and the
//! component accessors ([`builder`](PluginClient::builder), ...) return
//! proxies whose failures go through the plugin's [`ExitMonitor`].
//!
//! # Example
//!
//! ```ignore
//! let coordinator = ShutdownCoordinator::new();
//! let plugin = PluginClient::new(
//!     PluginClientConfig::new("buildplug-plugin-amazon")
//!         .args(["start", "builder", "ebs"])
//!         .managed(true),
//!     coordinator.clone(),
//! );
//! let builder = plugin.builder().await?;
//! builder.prepare(configs).await?;
//! // ...
//! coordinator.kill_all().await;
//! ```

mod cmd;
mod config;
mod exit;
mod shutdown;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::{
    Builder, BuilderClient, Datasource, DatasourceClient, Hook, HookClient, PostProcessor,
    PostProcessorClient, Provisioner, ProvisionerClient,
};
use crate::error::{PluginError, Result};
use crate::handshake::{
    Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, MAX_PORT_KEY, MIN_PORT_KEY,
};
use crate::protocol::PRIMARY_STREAM_ID;
use crate::rpc::RpcClient;
use crate::transport::PluginAddress;

pub use cmd::{CmdArtifact, CmdBuilder, CmdDatasource, CmdHook, CmdPostProcessor, CmdProvisioner};
pub use config::{LineSink, PluginClientConfig, DEFAULT_START_TIMEOUT};
pub use exit::{ExitCleanup, ExitMonitor};
pub use shutdown::ShutdownCoordinator;

/// How long to keep reading stdout for the handshake line after the process
/// has already exited.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// One plugin process and the connection to it.
pub struct PluginClient {
    config: PluginClientConfig,
    coordinator: Arc<ShutdownCoordinator>,
    /// Log prefix and exit-policy label.
    name: String,
    /// Serializes `start`; holds the message of a failed start.
    start_lock: Mutex<Option<String>>,
    address: OnceLock<PluginAddress>,
    spawned: AtomicBool,
    exited: Arc<watch::Sender<bool>>,
    done_logging: Arc<watch::Sender<bool>>,
    kill: CancellationToken,
    rpc: Mutex<Option<RpcClient>>,
}

impl PluginClient {
    /// Create a client. Nothing is spawned until [`start`](Self::start).
    ///
    /// Managed clients are registered with `coordinator` and killed by
    /// [`ShutdownCoordinator::kill_all`].
    pub fn new(config: PluginClientConfig, coordinator: Arc<ShutdownCoordinator>) -> Arc<Self> {
        let name = log_prefix(&config.command, &config.args);
        let client = Arc::new(Self {
            config,
            coordinator: coordinator.clone(),
            name,
            start_lock: Mutex::new(None),
            address: OnceLock::new(),
            spawned: AtomicBool::new(false),
            exited: Arc::new(watch::channel(false).0),
            done_logging: Arc::new(watch::channel(false).0),
            kill: CancellationToken::new(),
            rpc: Mutex::new(None),
        });
        if client.config.managed {
            coordinator.register(client.clone());
        }
        client
    }

    pub fn config(&self) -> &PluginClientConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the plugin and wait for its handshake.
    ///
    /// Idempotent: later calls return the same address without spawning
    /// again. A failed start is never retried.
    pub async fn start(&self) -> Result<PluginAddress> {
        let mut failure = self.start_lock.lock().await;
        if let Some(address) = self.address.get() {
            return Ok(address.clone());
        }
        if let Some(message) = failure.as_ref() {
            return Err(PluginError::StartFailed(message.clone()));
        }
        if self.kill.is_cancelled() {
            return Err(PluginError::StartFailed("plugin was killed".to_string()));
        }

        match self.launch().await {
            Ok(address) => {
                info!(plugin = %self.name, %address, "plugin started");
                let _ = self.address.set(address.clone());
                Ok(address)
            }
            Err(e) => {
                error!(
                    plugin = %self.name,
                    path = %self.config.command.display(),
                    error = %e,
                    "plugin failed to start"
                );
                *failure = Some(e.to_string());
                self.kill.cancel();
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<PluginAddress> {
        let path = resolve_executable(&self.config.command)?;

        let mut command = Command::new(&path);
        command
            .args(&self.config.args)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(MIN_PORT_KEY, self.config.min_port.to_string())
            .env(MAX_PORT_KEY, self.config.max_port.to_string())
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| PluginError::Spawn {
            path: path.clone(),
            source,
        })?;
        self.spawned.store(true, Ordering::SeqCst);
        debug!(plugin = %self.name, path = %path.display(), pid = ?child.id(), "plugin spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::protocol("plugin stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PluginError::protocol("plugin stderr not captured"))?;

        let (line_tx, mut line_rx) = oneshot::channel();
        let stdout_task = tokio::spawn(drain_stdout(stdout, self.name.clone(), line_tx));
        let stderr_task = tokio::spawn(drain_stderr(
            stderr,
            self.name.clone(),
            self.config.stderr.clone(),
        ));
        let done_logging = self.done_logging.clone();
        tokio::spawn(async move {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            done_logging.send_replace(true);
        });

        let exited = self.exited.clone();
        let kill = self.kill.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    debug!(plugin = %name, "killing plugin");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            match status {
                Ok(status) => debug!(plugin = %name, %status, "plugin process exited"),
                Err(e) => warn!(plugin = %name, error = %e, "error waiting for plugin"),
            }
            exited.send_replace(true);
        });

        let line = tokio::select! {
            biased;
            line = &mut line_rx => line.ok(),
            _ = wait_true(self.exited.subscribe()) => {
                tokio::time::timeout(EXIT_GRACE, &mut line_rx)
                    .await
                    .ok()
                    .and_then(|line| line.ok())
            }
            _ = tokio::time::sleep(self.config.start_timeout) => {
                return Err(PluginError::StartTimeout);
            }
        };
        let line = line.ok_or(PluginError::ExitedBeforeConnect)?;
        debug!(plugin = %self.name, line = %line, "handshake received");

        let handshake = Handshake::parse(&line)?;
        handshake.check_version()?;
        PluginAddress::resolve(handshake.network()?, &handshake.address).await
    }

    /// Connect to the plugin, starting it first if needed.
    ///
    /// The connection is made once and shared by every proxy derived from
    /// this client.
    pub async fn client(&self) -> Result<RpcClient> {
        let address = self.start().await?;
        let mut cached = self.rpc.lock().await;
        if let Some(rpc) = cached.as_ref() {
            return Ok(rpc.clone());
        }
        let mux = address.connect(self.config.mux.clone()).await?;
        let rpc = RpcClient::dial(&mux, PRIMARY_STREAM_ID).await?;
        *cached = Some(rpc.clone());
        Ok(rpc)
    }

    pub async fn builder(&self) -> Result<Arc<dyn Builder>> {
        let proxy = Arc::new(BuilderClient::new(self.client().await?));
        Ok(Arc::new(CmdBuilder::new(proxy, self.monitor())))
    }

    pub async fn provisioner(&self) -> Result<Arc<dyn Provisioner>> {
        let proxy = Arc::new(ProvisionerClient::new(self.client().await?));
        Ok(Arc::new(CmdProvisioner::new(proxy, self.monitor())))
    }

    pub async fn post_processor(&self) -> Result<Arc<dyn PostProcessor>> {
        let proxy = Arc::new(PostProcessorClient::new(self.client().await?));
        Ok(Arc::new(CmdPostProcessor::new(proxy, self.monitor())))
    }

    pub async fn datasource(&self) -> Result<Arc<dyn Datasource>> {
        let proxy = Arc::new(DatasourceClient::new(self.client().await?));
        Ok(Arc::new(CmdDatasource::new(proxy, self.monitor())))
    }

    pub async fn hook(&self) -> Result<Arc<dyn Hook>> {
        let proxy = Arc::new(HookClient::new(self.client().await?));
        Ok(Arc::new(CmdHook::new(proxy, self.monitor())))
    }

    /// Exit policy bound to this plugin's process state.
    pub fn monitor(&self) -> ExitMonitor {
        ExitMonitor::new(&self.name, self.exited.subscribe(), self.coordinator.clone())
    }

    /// Kill the plugin and wait until its output has been fully logged.
    ///
    /// No-op if the process was never spawned. Safe to call repeatedly.
    pub async fn kill(&self) {
        if !self.spawned.load(Ordering::SeqCst) {
            return;
        }
        self.kill.cancel();
        wait_true(self.done_logging.subscribe()).await;
    }

    pub fn exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Address from a successful [`start`](Self::start).
    pub fn address(&self) -> Option<PluginAddress> {
        self.address.get().cloned()
    }
}

impl fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClient")
            .field("name", &self.name)
            .field("command", &self.config.command)
            .field("address", &self.address.get())
            .field("exited", &self.exited())
            .finish()
    }
}

async fn wait_true(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|value| *value).await;
}

/// Bare names are looked up on `PATH`, then next to the current executable.
fn resolve_executable(command: &Path) -> Result<PathBuf> {
    let not_found = || PluginError::Spawn {
        path: command.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "executable not found"),
    };

    if command.is_absolute() || command.components().count() > 1 {
        return if command.is_file() {
            Ok(command.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(dir);
    }

    dirs.into_iter()
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
        .ok_or_else(not_found)
}

/// The binary's basename, or its last argument when the plugin is our own
/// executable re-invoked.
fn log_prefix(command: &Path, args: &[String]) -> String {
    let base = command
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.display().to_string());
    let own = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy().into_owned()));
    match (own, args.last()) {
        (Some(own), Some(last)) if own == base => last.clone(),
        _ => base,
    }
}

async fn read_lines<R, F>(pipe: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        on_line(&String::from_utf8_lossy(&buf));
    }
}

/// First line goes to `handshake`; the rest is logged.
async fn drain_stdout(stdout: ChildStdout, name: String, handshake: oneshot::Sender<String>) {
    let mut handshake = Some(handshake);
    let result = read_lines(stdout, |line| match handshake.take() {
        Some(tx) => {
            let _ = tx.send(line.trim_end().to_string());
        }
        None => debug!(plugin = %name, "{}", line.trim_end()),
    })
    .await;
    if let Err(e) = result {
        debug!(plugin = %name, error = %e, "error reading plugin stdout");
    }
}

async fn drain_stderr(stderr: ChildStderr, name: String, sink: Option<LineSink>) {
    let result = read_lines(stderr, |line| {
        if let Some(sink) = &sink {
            sink(line);
        }
        info!(plugin = %name, "{}", line.trim_end());
    })
    .await;
    if let Err(e) = result {
        debug!(plugin = %name, error = %e, "error reading plugin stderr");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn script_client(script: &str) -> Arc<PluginClient> {
        script_client_with(script, |config| config)
    }

    fn script_client_with(
        script: &str,
        configure: impl FnOnce(PluginClientConfig) -> PluginClientConfig,
    ) -> Arc<PluginClient> {
        let config = PluginClientConfig::new("/bin/sh")
            .args(["-c", script])
            .start_timeout(Duration::from_secs(5));
        PluginClient::new(configure(config), ShutdownCoordinator::new())
    }

    #[tokio::test]
    async fn test_start_passes_environment() {
        let client = script_client_with(
            r#"[ "$BUILDPLUG_PLUGIN_MAGIC_COOKIE" = d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2 ] || exit 1
echo "5|0|tcp|127.0.0.1:$BUILDPLUG_PLUGIN_MIN_PORT"
exec sleep 5"#,
            |config| config.port_range(12345, 12350),
        );
        let address = client.start().await.unwrap();
        assert_eq!(address.to_string(), "127.0.0.1:12345");
        assert_eq!(client.address(), Some(address));
        client.kill().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("count");
        let script = format!(
            "echo started >> '{}'\necho '5|0|tcp|127.0.0.1:10999'\nexec sleep 5",
            count.display()
        );
        let client = script_client(&script);

        let first = client.start().await.unwrap();
        let second = client.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&count).unwrap().lines().count(), 1);
        client.kill().await;
    }

    #[tokio::test]
    async fn test_major_mismatch() {
        let client = script_client("echo '4|0|tcp|127.0.0.1:10999'\nexec sleep 5");
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::IncompatibleMajor { ref plugin, ours: 5 } if plugin == "4"));
        assert!(client.address().is_none());
    }

    #[tokio::test]
    async fn test_newer_minor_rejected() {
        let client = script_client("echo '5|1|tcp|127.0.0.1:10999'\nexec sleep 5");
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::IncompatibleMinor { plugin: 1, ours: 0 }));
        assert!(err.to_string().contains("upgrade"));
    }

    #[tokio::test]
    async fn test_failed_start_not_retried() {
        let client = script_client("echo '4|0|tcp|127.0.0.1:10999'\nexec sleep 5");
        client.start().await.unwrap_err();
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::StartFailed(_)));
    }

    #[tokio::test]
    async fn test_legacy_handshake() {
        let client = script_client("echo '5|tcp|127.0.0.1:10999'\nexec sleep 5");
        assert!(matches!(
            client.start().await.unwrap_err(),
            PluginError::LegacyProtocol
        ));
    }

    #[tokio::test]
    async fn test_exited_before_handshake() {
        let client = script_client("exit 3");
        assert!(matches!(
            client.start().await.unwrap_err(),
            PluginError::ExitedBeforeConnect
        ));
        wait_true(client.exited.subscribe()).await;
        assert!(client.exited());
    }

    #[tokio::test]
    async fn test_handshake_printed_just_before_exit() {
        let client = script_client("echo '5|0|tcp|127.0.0.1:10999'");
        client.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let client = script_client_with("exec sleep 5", |config| {
            config.start_timeout(Duration::from_millis(200))
        });
        assert!(matches!(
            client.start().await.unwrap_err(),
            PluginError::StartTimeout
        ));
        client.kill().await;
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let client = PluginClient::new(
            PluginClientConfig::new("buildplug-definitely-not-installed"),
            ShutdownCoordinator::new(),
        );
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::Spawn { .. }));
        assert!(err.to_string().contains("buildplug-definitely-not-installed"));
    }

    #[tokio::test]
    async fn test_kill_never_started_is_noop() {
        let client = script_client("exec sleep 5");
        client.kill().await;
        assert!(!client.exited());
    }

    #[tokio::test]
    async fn test_kill_twice() {
        let client = script_client("echo '5|0|tcp|127.0.0.1:10999'\nexec sleep 30");
        client.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.kill())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.kill())
            .await
            .unwrap();
        wait_true(client.exited.subscribe()).await;
        assert!(client.exited());
    }

    #[tokio::test]
    async fn test_stderr_reaches_sink_before_kill_returns() {
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let client = script_client_with(
            "echo oops >&2\necho '5|0|tcp|127.0.0.1:10999'\nexec sleep 30",
            |config| {
                config.stderr(Arc::new(move |line: &str| {
                    sink_lines.lock().unwrap().push(line.to_string());
                }))
            },
        );
        client.start().await.unwrap();
        client.kill().await;
        assert_eq!(*lines.lock().unwrap(), vec!["oops\n".to_string()]);
    }

    #[test]
    fn test_log_prefix_uses_basename() {
        let prefix = log_prefix(Path::new("/opt/plugins/buildplug-builder-ebs"), &[]);
        assert_eq!(prefix, "buildplug-builder-ebs");
    }

    #[test]
    fn test_log_prefix_for_own_binary_uses_last_arg() {
        let own = std::env::current_exe().unwrap();
        let args = vec!["start".to_string(), "builder".to_string(), "ebs".to_string()];
        assert_eq!(log_prefix(&own, &args), "ebs");
    }

    #[test]
    fn test_resolve_relative_missing() {
        assert!(resolve_executable(Path::new("./no/such/plugin")).is_err());
    }
}
