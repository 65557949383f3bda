//! # buildplug
//!
//! Out-of-process plugin transport for an image-build orchestrator.
//!
//! Plugins (builders, provisioners, post-processors, datasources) run as
//! child processes. The orchestrator launches them, reads a one-line
//! handshake from their stdout, then talks to them over a single socket.
//!
//! ## Architecture
//!
//! - **Handshake** (stdout): `MAJOR|MINOR|NETWORK|ADDRESS`, see [`handshake`]
//! - **Multiplexer**: many independent byte streams over the one socket, each
//!   with its own flow-control window, see [`mux`]
//! - **RPC**: length-prefixed msgpack requests and replies on a stream, see
//!   [`rpc`]
//! - **Components**: typed proxies and server adapters for the eight
//!   component interfaces; callbacks (UI, hooks, communicators, artifacts)
//!   travel on streams minted per call, see [`component`]
//!
//! ## Orchestrator side
//!
//! ```ignore
//! use buildplug::client::{PluginClient, PluginClientConfig, ShutdownCoordinator};
//!
//! let coordinator = ShutdownCoordinator::new();
//! let plugin = PluginClient::new(
//!     PluginClientConfig::new("buildplug-plugin-amazon")
//!         .args(["start", "builder", "ebs"])
//!         .managed(true),
//!     coordinator.clone(),
//! );
//! let builder = plugin.builder().await?;
//! let artifact = builder.run(ctx, ui, hook).await?;
//! coordinator.kill_all().await;
//! ```
//!
//! ## Plugin side
//!
//! ```ignore
//! use buildplug::server::{PluginSet, DEFAULT_COMPONENT};
//!
//! let mut set = PluginSet::new("1.0.0");
//! set.register_builder(DEFAULT_COMPONENT, Arc::new(MyBuilder::default()));
//! set.run(&std::env::args().skip(1).collect::<Vec<_>>()).await?;
//! ```

pub mod client;
pub mod codec;
pub mod component;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod mux;
pub mod protocol;
pub mod rpc;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

mod writer;

pub use client::{PluginClient, PluginClientConfig, ShutdownCoordinator};
pub use error::{PluginError, Result};
pub use handler::RequestContext;
pub use mux::{MuxConfig, MuxConn, MuxStream, Role};
pub use rpc::{RpcClient, RpcServer};
pub use server::{PluginServer, PluginSet};
pub use writer::WriterConfig;
