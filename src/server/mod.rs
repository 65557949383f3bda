//! Plugin side: serving a component to the orchestrator.
//!
//! Lifecycle of a plugin process:
//! 1. Check the magic cookie ([`PluginServer::from_env`])
//! 2. Bind a listener (Unix socket, or a TCP port in the allowed range)
//! 3. Print the handshake line on stdout
//! 4. Accept the orchestrator's connection and its primary stream
//! 5. Serve the component until the connection ends
//!
//! # Example
//!
//! ```ignore
//! use buildplug::server::{Component, PluginServer};
//!
//! #[tokio::main]
//! async fn main() -> buildplug::Result<()> {
//!     PluginServer::from_env()?
//!         .serve(Component::Builder(Arc::new(MyBuilder::default())))
//!         .await
//! }
//! ```

mod set;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::component::{
    registry_for, Builder, BuilderServer, Datasource, DatasourceServer, Hook, HookServer,
    PostProcessor, PostProcessorServer, Provisioner, ProvisionerServer, Service,
};
use crate::error::{PluginError, Result};
use crate::handshake::{
    is_plugin_process, write_stdout_line, Network, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT,
    MAX_PORT_KEY, MIN_PORT_KEY,
};
use crate::mux::{MuxConfig, MuxConn};
use crate::protocol::PRIMARY_STREAM_ID;
use crate::rpc::{RpcServer, DEFAULT_MAX_CONCURRENT_REQUESTS};
use crate::transport::{generate_socket_path, PluginListener};

pub use set::{PluginSet, SetDescription, DEFAULT_COMPONENT};

/// Kinds of component a plugin set can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    Builder,
    Provisioner,
    PostProcessor,
    Datasource,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Builder,
        ComponentKind::Provisioner,
        ComponentKind::PostProcessor,
        ComponentKind::Datasource,
    ];

    /// Name used on the command line and in binary names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Builder => "builder",
            ComponentKind::Provisioner => "provisioner",
            ComponentKind::PostProcessor => "post-processor",
            ComponentKind::Datasource => "datasource",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        ComponentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PluginError::Usage(format!("unknown component kind {s:?}")))
    }
}

/// A local implementation to serve on the primary stream.
#[derive(Clone)]
pub enum Component {
    Builder(Arc<dyn Builder>),
    Provisioner(Arc<dyn Provisioner>),
    PostProcessor(Arc<dyn PostProcessor>),
    Datasource(Arc<dyn Datasource>),
    Hook(Arc<dyn Hook>),
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Builder(_) => "builder",
            Component::Provisioner(_) => "provisioner",
            Component::PostProcessor(_) => "post-processor",
            Component::Datasource(_) => "datasource",
            Component::Hook(_) => "hook",
        }
    }

    /// Server adapter for this component on `mux`.
    fn service(&self, mux: MuxConn) -> Arc<dyn Service> {
        match self {
            Component::Builder(b) => Arc::new(BuilderServer::new(b.clone(), mux)),
            Component::Provisioner(p) => Arc::new(ProvisionerServer::new(p.clone(), mux)),
            Component::PostProcessor(p) => Arc::new(PostProcessorServer::new(p.clone(), mux)),
            Component::Datasource(d) => Arc::new(DatasourceServer::new(d.clone())),
            Component::Hook(h) => Arc::new(HookServer::new(h.clone())),
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Component").field(&self.name()).finish()
    }
}

/// Plugin-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub min_port: u16,
    pub max_port: u16,
    /// `Unix` on Unix platforms, `Tcp` elsewhere.
    pub network: Network,
    pub mux: MuxConfig,
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            network: if cfg!(unix) { Network::Unix } else { Network::Tcp },
            mux: MuxConfig::default(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

impl ServerConfig {
    /// Defaults, with the port range taken from the environment the
    /// orchestrator set up.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(port) = port_from_env(MIN_PORT_KEY)? {
            config.min_port = port;
        }
        if let Some(port) = port_from_env(MAX_PORT_KEY)? {
            config.max_port = port;
        }
        Ok(config)
    }

    pub fn network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }
}

fn port_from_env(key: &str) -> Result<Option<u16>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PluginError::Usage(format!("{key} is not a port number: {value:?}"))),
        Err(_) => Ok(None),
    }
}

/// Serves one component over the plugin protocol.
#[derive(Debug, Clone, Default)]
pub struct PluginServer {
    config: ServerConfig,
}

impl PluginServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Server for a process launched by the orchestrator.
    ///
    /// Fails with [`PluginError::NotPluginProcess`] when the magic cookie is
    /// missing.
    pub fn from_env() -> Result<Self> {
        if !is_plugin_process() {
            return Err(PluginError::NotPluginProcess);
        }
        Ok(Self::new(ServerConfig::from_env()?))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener advertised in the handshake.
    pub async fn bind(&self) -> Result<PluginListener> {
        match self.config.network {
            #[cfg(unix)]
            Network::Unix => PluginListener::bind_unix(generate_socket_path()).await,
            _ => PluginListener::bind_tcp_range(self.config.min_port, self.config.max_port).await,
        }
    }

    /// Bind, announce the handshake on stdout and serve `component` until
    /// the orchestrator disconnects.
    pub async fn serve(&self, component: Component) -> Result<()> {
        let listener = self.bind().await?;
        let handshake = listener.handshake()?;
        write_stdout_line(&handshake.to_line())?;
        debug!(line = %handshake.to_line(), "handshake written");
        self.serve_listener(listener, component).await
    }

    /// Accept one connection on `listener` and serve `component` on its
    /// primary stream.
    pub async fn serve_listener(&self, listener: PluginListener, component: Component) -> Result<()> {
        let mux = listener.accept(self.config.mux.clone()).await?;
        drop(listener);

        let stream = mux.accept(PRIMARY_STREAM_ID).await?;
        let registry = registry_for(vec![component.service(mux.clone())]);
        info!(component = component.name(), "serving plugin component");

        let result = RpcServer::new(registry)
            .with_max_concurrent(self.config.max_concurrent_requests)
            .serve(stream)
            .await;
        mux.close();
        debug!(component = component.name(), "orchestrator disconnected");
        match result {
            Err(PluginError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }
}
