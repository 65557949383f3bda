//! Error types for buildplug.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the plugin transport.
#[derive(Debug, Error)]
pub enum PluginError {
    /// I/O error (pipe, socket, process).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Wire-level protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The underlying connection or stream is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A stream with this ID is already open locally.
    #[error("Stream {id} is already in use ({state})")]
    StreamBusy { id: u32, state: &'static str },

    /// No more stream IDs can be minted on this connection.
    #[error("Stream identifier space exhausted")]
    StreamIdsExhausted,

    /// The remote server has no handler for the method.
    #[error("Unknown RPC method: {0}")]
    UnknownMethod(String),

    /// Application error returned by the remote implementation.
    #[error("{0}")]
    Remote(String),

    /// The plugin executable could not be launched.
    #[error("Error starting plugin {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No handshake line within the start timeout.
    #[error("timeout while waiting for plugin to start")]
    StartTimeout,

    /// An earlier `start` of this plugin failed; plugins are never restarted.
    #[error("plugin failed to start: {0}")]
    StartFailed(String),

    /// The plugin process died before printing its handshake line.
    #[error("plugin exited before we could connect")]
    ExitedBeforeConnect,

    /// Three-part handshake line from a plugin built against a retired protocol.
    #[error(
        "The plugin you're attempting to use is built against a deprecated protocol. \
         Please use a newer version of the plugin, or ask the plugin author to rebuild it."
    )]
    LegacyProtocol,

    /// Handshake line that could not be parsed.
    #[error("Unrecognized remote plugin message: {0}")]
    UnrecognizedMessage(String),

    /// Plugin speaks a different API major version.
    #[error("Incompatible API MAJOR version with plugin. Plugin version: {plugin}, Ours: {ours}")]
    IncompatibleMajor { plugin: String, ours: u32 },

    /// Plugin was built against a newer API minor version than we support.
    #[error(
        "Incompatible API MINOR version with plugin. Plugin version: {plugin}, Ours: {ours}. \
         Please upgrade buildplug."
    )]
    IncompatibleMinor { plugin: u32, ours: u32 },

    /// Handshake advertised a network we cannot dial.
    #[error("Unknown address type: {0}")]
    UnknownNetwork(String),

    /// A plugin binary was run without the magic cookie.
    #[error(
        "This is a buildplug plugin. Plugins are not meant to be executed directly; \
         they are launched by the orchestrator."
    )]
    NotPluginProcess,

    /// No component of this kind and name is registered.
    #[error("unknown {kind} {name:?}")]
    UnknownComponent { kind: String, name: String },

    /// Command-line arguments a plugin binary does not understand.
    #[error("usage: {0}")]
    Usage(String),

    /// Plugin binaries could not be enumerated or described.
    #[error("Plugin discovery error: {0}")]
    Discovery(String),

    /// Classified transport failure surfaced by the exit policy.
    ///
    /// `fatal` is true when the plugin was believed alive and no shutdown was
    /// underway; such failures must never be treated as benign.
    #[error("plugin transport failure{}: {message}", fatal_suffix(.fatal))]
    Transport { fatal: bool, message: String },

    /// An error annotated with the call that produced it.
    #[error("{call}: {source}")]
    Call {
        call: &'static str,
        #[source]
        source: Box<PluginError>,
    },
}

impl PluginError {
    /// Build a protocol error from anything printable.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        PluginError::Protocol(message.into())
    }

    /// True for failures of the connection itself rather than of the remote
    /// implementation: closed streams, I/O, undecodable replies, protocol
    /// violations.
    pub fn is_transport(&self) -> bool {
        match self {
            PluginError::Io(_)
            | PluginError::MsgPackDecode(_)
            | PluginError::Protocol(_)
            | PluginError::ConnectionClosed
            | PluginError::Transport { .. } => true,
            PluginError::Call { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// True when this is a transport failure that must not be swallowed.
    pub fn is_fatal(&self) -> bool {
        match self {
            PluginError::Transport { fatal, .. } => *fatal,
            PluginError::Call { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Strip [`PluginError::Call`] annotations.
    pub fn root(&self) -> &PluginError {
        match self {
            PluginError::Call { source, .. } => source.root(),
            other => other,
        }
    }
}

fn fatal_suffix(fatal: &bool) -> &'static str {
    if *fatal {
        " (fatal)"
    } else {
        ""
    }
}

/// Result type alias for buildplug operations.
pub type Result<T> = std::result::Result<T, PluginError>;
