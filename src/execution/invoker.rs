//! Calling a stage's remote RPC.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message as _;
use prost_reflect::DynamicMessage;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::Request;
use tracing::debug;

use super::codec::RawCodec;
use crate::error::{Error, Result};
use crate::grpc::connect_with_retry;
use crate::reflection::Rpc;

/// Performs one unary call of a reflected RPC.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Send `request` and merge the reply into `reply`, a fresh empty
    /// instance of the RPC's output message.
    async fn invoke(
        &self,
        rpc: &Rpc,
        request: &DynamicMessage,
        reply: &mut DynamicMessage,
    ) -> Result<()>;
}

/// Turns a stage address into an [`Invoker`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Invoker>>;
}

/// Invoker over a tonic channel.
#[derive(Clone)]
pub struct GrpcInvoker {
    channel: Channel,
}

impl GrpcInvoker {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Invoker for GrpcInvoker {
    async fn invoke(
        &self,
        rpc: &Rpc,
        request: &DynamicMessage,
        reply: &mut DynamicMessage,
    ) -> Result<()> {
        let path = PathAndQuery::try_from(rpc.path().as_str())
            .map_err(|e| Error::invalid_argument(format!("invalid rpc path {}: {}", rpc.path(), e)))?;

        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::unavailable(format!("channel not ready: {}", e)))?;

        let body = Bytes::from(request.encode_to_vec());
        let response = grpc.unary(Request::new(body), path, RawCodec).await?;

        reply.merge(response.into_inner()).map_err(|e| {
            Error::internal(format!("decode reply of {}: {}", rpc.full_name(), e))
        })?;
        debug!(rpc = %rpc.full_name(), "Invoked");
        Ok(())
    }
}

/// Dials stages over gRPC, retrying the connection a bounded number of
/// times.
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    retries: u32,
}

impl GrpcDialer {
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }
}

impl Default for GrpcDialer {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Invoker>> {
        let channel = connect_with_retry("stage", address, self.retries).await?;
        Ok(Arc::new(GrpcInvoker::new(channel)))
    }
}
