//! Startup handshake between the orchestrator and a plugin process.
//!
//! The orchestrator launches the plugin with [`MAGIC_COOKIE_KEY`] set and a
//! port range in [`MIN_PORT_KEY`]/[`MAX_PORT_KEY`]. The plugin binds a
//! listener and announces it with exactly one line on stdout:
//!
//! ```text
//! MAJOR|MINOR|NETWORK|ADDRESS
//! 5|0|unix|/tmp/buildplug-plugin-1234-9f2c.sock
//! ```
//!
//! Everything after that line is ordinary log output.
//!
//! # Example
//!
//! ```
//! use buildplug::handshake::{Handshake, Network};
//!
//! let line = Handshake::current(Network::Tcp, "127.0.0.1:10000").to_line();
//! let parsed = Handshake::parse(&line).unwrap();
//! parsed.check_version().unwrap();
//! assert_eq!(parsed.address, "127.0.0.1:10000");
//! ```

mod stdio;

use std::fmt;
use std::str::FromStr;

use crate::error::{PluginError, Result};

pub use stdio::{write_stdout_json, write_stdout_line};

/// Environment variable that marks a process as launched by the orchestrator.
pub const MAGIC_COOKIE_KEY: &str = "BUILDPLUG_PLUGIN_MAGIC_COOKIE";

/// Expected value of [`MAGIC_COOKIE_KEY`].
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

/// Lowest port a plugin may listen on.
pub const MIN_PORT_KEY: &str = "BUILDPLUG_PLUGIN_MIN_PORT";

/// Highest port a plugin may listen on.
pub const MAX_PORT_KEY: &str = "BUILDPLUG_PLUGIN_MAX_PORT";

pub const DEFAULT_MIN_PORT: u16 = 10000;
pub const DEFAULT_MAX_PORT: u16 = 25000;

/// Protocol major version. Must match exactly.
pub const API_VERSION_MAJOR: u32 = 5;

/// Highest protocol minor version this build understands.
pub const API_VERSION_MINOR: u32 = 0;

/// True when the current process was launched as a plugin.
pub fn is_plugin_process() -> bool {
    std::env::var(MAGIC_COOKIE_KEY).is_ok_and(|v| v == MAGIC_COOKIE_VALUE)
}

/// Transport advertised in the handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(PluginError::UnknownNetwork(other.to_string())),
        }
    }
}

/// A parsed handshake line.
///
/// `network` is kept verbatim; an unknown network is only an error once the
/// orchestrator tries to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Kept as text so a mismatch can be reported exactly as the plugin sent it.
    pub major: String,
    pub minor: u32,
    pub network: String,
    pub address: String,
}

impl Handshake {
    /// Handshake for this build's protocol version.
    pub fn current(network: Network, address: impl Into<String>) -> Self {
        Self {
            major: API_VERSION_MAJOR.to_string(),
            minor: API_VERSION_MINOR,
            network: network.as_str().to_string(),
            address: address.into(),
        }
    }

    /// Parse a handshake line (surrounding whitespace is ignored).
    ///
    /// A three-field line comes from a plugin built for the retired protocol
    /// and is rejected with [`PluginError::LegacyProtocol`]. The address may
    /// itself contain `|`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.splitn(4, '|').collect();
        match parts.as_slice() {
            [major, minor, network, address] => {
                // A foreign major may use any minor format; report the
                // version, not the syntax.
                let minor = match minor.parse::<u32>() {
                    Ok(minor) => minor,
                    Err(_) => {
                        check_api_version(major, 0)?;
                        return Err(PluginError::UnrecognizedMessage(line.to_string()));
                    }
                };
                Ok(Self {
                    major: major.to_string(),
                    minor,
                    network: network.to_string(),
                    address: address.to_string(),
                })
            }
            [_, _, _] => Err(PluginError::LegacyProtocol),
            _ => Err(PluginError::UnrecognizedMessage(line.to_string())),
        }
    }

    /// Reject plugins with a different major or a newer minor version.
    pub fn check_version(&self) -> Result<()> {
        check_api_version(&self.major, self.minor)
    }

    pub fn network(&self) -> Result<Network> {
        self.network.parse()
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.major, self.minor, self.network, self.address
        )
    }
}

/// Compare a plugin's advertised API version with ours.
///
/// Older plugin minors are accepted; newer ones require upgrading the
/// orchestrator.
pub fn check_api_version(major: &str, minor: u32) -> Result<()> {
    if major != API_VERSION_MAJOR.to_string() {
        return Err(PluginError::IncompatibleMajor {
            plugin: major.to_string(),
            ours: API_VERSION_MAJOR,
        });
    }
    if minor > API_VERSION_MINOR {
        return Err(PluginError::IncompatibleMinor {
            plugin: minor,
            ours: API_VERSION_MINOR,
        });
    }
    Ok(())
}

/// The `api_version` a plugin set reports in its `describe` output,
/// formatted `x<major>.<minor>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const CURRENT: ApiVersion = ApiVersion {
        major: API_VERSION_MAJOR,
        minor: API_VERSION_MINOR,
    };

    pub fn check(&self) -> Result<()> {
        check_api_version(&self.major.to_string(), self.minor)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PluginError::Discovery(format!("invalid api_version {s:?}"));
        let (major, minor) = s
            .strip_prefix('x')
            .and_then(|rest| rest.split_once('.'))
            .ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}
