//! Plugin-side listener.
//!
//! - Unix: a Unix domain socket in the temp directory
//! - elsewhere (or on request): the first free TCP port in a range
//!
//! # Example
//!
//! ```ignore
//! let listener = PluginListener::bind_unix(&generate_socket_path()).await?;
//! write_stdout_line(&listener.handshake().to_line())?;
//! let mux = listener.accept(MuxConfig::default()).await?;
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::error::{PluginError, Result};
use crate::handshake::{Handshake, Network};
use crate::mux::{MuxConfig, MuxConn, Role};

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/buildplug-plugin-{pid}-{random}.sock`
pub fn generate_socket_path() -> PathBuf {
    let pid = std::process::id();
    std::env::temp_dir().join(format!("buildplug-plugin-{}-{:x}.sock", pid, rand_u64()))
}

/// Simple random u64 using system time and process ID.
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid
}

/// Accepts the orchestrator's single connection.
#[derive(Debug)]
pub enum PluginListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl PluginListener {
    /// Bind the first free loopback port in `min..=max`.
    pub async fn bind_tcp_range(min: u16, max: u16) -> Result<Self> {
        if min > max {
            return Err(PluginError::protocol(format!(
                "invalid port range {min}-{max}"
            )));
        }
        for port in min..=max {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    debug!(port, "plugin listening on tcp");
                    return Ok(PluginListener::Tcp(listener));
                }
                Err(e) => trace!(port, error = %e, "port unavailable"),
            }
        }
        Err(PluginError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free port in range {min}-{max}"),
        )))
    }

    /// Bind a Unix socket at `path`.
    ///
    /// Removes any existing socket file at the path before binding.
    #[cfg(unix)]
    pub async fn bind_unix(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        debug!(path = %path.display(), "plugin listening on unix socket");
        Ok(PluginListener::Unix { listener, path })
    }

    /// Network and address to advertise in the handshake line.
    pub fn handshake(&self) -> Result<Handshake> {
        match self {
            PluginListener::Tcp(listener) => Ok(Handshake::current(
                Network::Tcp,
                listener.local_addr()?.to_string(),
            )),
            #[cfg(unix)]
            PluginListener::Unix { path, .. } => Ok(Handshake::current(
                Network::Unix,
                path.to_string_lossy().into_owned(),
            )),
        }
    }

    /// Accept one connection and start multiplexing as the server role.
    pub async fn accept(&self, config: MuxConfig) -> Result<MuxConn> {
        match self {
            PluginListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(%peer, "orchestrator connected");
                Ok(MuxConn::new(stream, Role::Server, config))
            }
            #[cfg(unix)]
            PluginListener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                debug!("orchestrator connected");
                Ok(MuxConn::new(stream, Role::Server, config))
            }
        }
    }
}

impl Drop for PluginListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let PluginListener::Unix { path, .. } = self {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
