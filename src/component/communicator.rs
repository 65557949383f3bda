//! Remote machine access handed to provisioners.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{expose, CommonClient, Endpoint, Service};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::rpc::RpcClient;

/// A command to run on the remote machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCmd {
    pub command: String,
    #[serde(default, with = "serde_bytes")]
    pub stdin: Vec<u8>,
}

impl RemoteCmd {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: Vec::new(),
        }
    }
}

/// Result of a finished [`RemoteCmd`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_status: i32,
    #[serde(with = "serde_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait Communicator: Send + Sync {
    async fn start(&self, cmd: RemoteCmd) -> Result<CommandOutput>;
    async fn upload(&self, path: &str, data: Vec<u8>, mode: Option<u32>) -> Result<()>;
    async fn upload_dir(&self, dst: &str, src: &str, exclude: &[String]) -> Result<()>;
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    async fn download_dir(&self, src: &str, dst: &str, exclude: &[String]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadArgs {
    path: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    mode: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirArgs {
    src: String,
    dst: String,
    exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommunicatorClient {
    common: CommonClient,
}

impl CommunicatorClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            common: CommonClient::new(Endpoint::Communicator, rpc),
        }
    }
}

#[async_trait]
impl Communicator for CommunicatorClient {
    async fn start(&self, cmd: RemoteCmd) -> Result<CommandOutput> {
        self.common.call("Start", &cmd).await
    }

    async fn upload(&self, path: &str, data: Vec<u8>, mode: Option<u32>) -> Result<()> {
        let args = UploadArgs {
            path: path.to_string(),
            data,
            mode,
        };
        self.common.call("Upload", &args).await
    }

    async fn upload_dir(&self, dst: &str, src: &str, exclude: &[String]) -> Result<()> {
        let args = DirArgs {
            src: src.to_string(),
            dst: dst.to_string(),
            exclude: exclude.to_vec(),
        };
        self.common.call("UploadDir", &args).await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let data: serde_bytes::ByteBuf = self.common.call("Download", path).await?;
        Ok(data.into_vec())
    }

    async fn download_dir(&self, src: &str, dst: &str, exclude: &[String]) -> Result<()> {
        let args = DirArgs {
            src: src.to_string(),
            dst: dst.to_string(),
            exclude: exclude.to_vec(),
        };
        self.common.call("DownloadDir", &args).await
    }
}

pub struct CommunicatorServer {
    comm: Arc<dyn Communicator>,
}

impl CommunicatorServer {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }
}

impl Service for CommunicatorServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Communicator
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let ep = Endpoint::Communicator;
        expose(registry, &self, ep, "Start", |s, cmd: RemoteCmd| async move {
            s.comm.start(cmd).await
        });
        expose(registry, &self, ep, "Upload", |s, args: UploadArgs| async move {
            s.comm.upload(&args.path, args.data, args.mode).await
        });
        expose(registry, &self, ep, "UploadDir", |s, args: DirArgs| async move {
            s.comm.upload_dir(&args.dst, &args.src, &args.exclude).await
        });
        expose(registry, &self, ep, "Download", |s, path: String| async move {
            s.comm.download(&path).await.map(serde_bytes::ByteBuf::from)
        });
        expose(registry, &self, ep, "DownloadDir", |s, args: DirArgs| async move {
            s.comm.download_dir(&args.src, &args.dst, &args.exclude).await
        });
    }
}
