//! Transport module - the physical connection between orchestrator and plugin.
//!
//! Provides:
//! - [`PluginAddress`] - where a plugin listens (TCP or Unix domain socket)
//! - [`PluginListener`] - the plugin side's single-connection listener
//!
//! Both sides wrap the resulting socket in a [`MuxConn`](crate::mux::MuxConn):
//! the orchestrator as [`Role::Client`](crate::mux::Role::Client), the plugin
//! as [`Role::Server`](crate::mux::Role::Server).

mod listener;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{PluginError, Result};
use crate::handshake::Network;
use crate::mux::{MuxConfig, MuxConn, Role};

pub use listener::{generate_socket_path, PluginListener};

/// A resolved plugin listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginAddress {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl PluginAddress {
    /// Resolve the address part of a handshake line.
    ///
    /// TCP addresses may name a host; the first resolved address is used.
    pub async fn resolve(network: Network, address: &str) -> Result<Self> {
        match network {
            Network::Tcp => {
                let resolved = tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
                    PluginError::UnrecognizedMessage(format!("no address for {address}"))
                })?;
                Ok(PluginAddress::Tcp(resolved))
            }
            #[cfg(unix)]
            Network::Unix => Ok(PluginAddress::Unix(PathBuf::from(address))),
            #[cfg(not(unix))]
            Network::Unix => Err(PluginError::UnknownNetwork(network.to_string())),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            PluginAddress::Tcp(_) => Network::Tcp,
            #[cfg(unix)]
            PluginAddress::Unix(_) => Network::Unix,
        }
    }

    /// Dial the plugin and start multiplexing as the client role.
    pub async fn connect(&self, config: MuxConfig) -> Result<MuxConn> {
        debug!(address = %self, "connecting to plugin");
        match self {
            PluginAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(MuxConn::new(stream, Role::Client, config))
            }
            #[cfg(unix)]
            PluginAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(MuxConn::new(stream, Role::Client, config))
            }
        }
    }
}

impl fmt::Display for PluginAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginAddress::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            PluginAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_tcp_literal() {
        let addr = PluginAddress::resolve(Network::Tcp, "127.0.0.1:10042")
            .await
            .unwrap();
        assert_eq!(addr, PluginAddress::Tcp("127.0.0.1:10042".parse().unwrap()));
        assert_eq!(addr.network(), Network::Tcp);
        assert_eq!(addr.to_string(), "127.0.0.1:10042");
    }

    #[tokio::test]
    async fn test_resolve_tcp_host_name() {
        let addr = PluginAddress::resolve(Network::Tcp, "localhost:10043")
            .await
            .unwrap();
        match addr {
            PluginAddress::Tcp(sock) => {
                assert!(sock.ip().is_loopback());
                assert_eq!(sock.port(), 10043);
            }
            #[cfg(unix)]
            other => panic!("unexpected address {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_tcp_garbage() {
        assert!(PluginAddress::resolve(Network::Tcp, "not an address")
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_unix() {
        let addr = PluginAddress::resolve(Network::Unix, "/tmp/x.sock")
            .await
            .unwrap();
        assert_eq!(addr, PluginAddress::Unix(PathBuf::from("/tmp/x.sock")));
    }
}
