//! Request/response RPC over a multiplexed stream.
//!
//! Each stream carries one direction of calls: the side holding an
//! [`RpcClient`] sends [`Request`]s, the side running an [`RpcServer`]
//! answers with [`Response`]s. Calls are pipelined and matched by `seq`, so
//! replies may arrive in any order.
//!
//! Both envelopes are length-prefixed MsgPack maps (see [`crate::codec`]).
//! The method arguments and result travel as an opaque MsgPack `body`
//! nested inside the envelope.

mod client;
mod server;

use serde::{Deserialize, Serialize};

pub use client::RpcClient;
pub use server::{RpcServer, DEFAULT_MAX_CONCURRENT_REQUESTS};

/// A call from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    /// `"Endpoint.Method"`.
    pub method: String,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// The server's answer to the [`Request`] with the same `seq`.
///
/// `error` carries an application error message; when it is set, `body` is
/// empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;

    #[test]
    fn test_response_without_error_field() {
        #[derive(Serialize)]
        struct Bare {
            seq: u64,
            #[serde(with = "serde_bytes")]
            body: Vec<u8>,
        }

        let encoded = MsgPackCodec::encode(&Bare {
            seq: 9,
            body: vec![0xc0],
        })
        .unwrap();
        let response: Response = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(response.seq, 9);
        assert!(response.error.is_none());
        assert_eq!(response.body, vec![0xc0]);
    }
}
