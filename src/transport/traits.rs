//! Transport trait abstraction for pluggable listening endpoints

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A transport stream that can read and write bytes
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A bound endpoint that accepts inbound peer connections
#[async_trait]
pub trait EndpointListener: Send + Sync + 'static {
    /// The stream type produced for each accepted peer
    type Stream: TransportStream;

    /// Wait for the next peer connection
    async fn accept(&self) -> Result<(Self::Stream, SocketAddr)>;

    /// Address the endpoint is actually bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
