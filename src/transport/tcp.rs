//! TCP transport implementation for simulator connections

use crate::transport::traits::{EndpointListener, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use sitl_bridge_shared::BridgeError;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for TcpTransportStream {}

/// TCP server endpoint simulator clients connect to
pub struct TcpEndpoint {
    listener: TcpListener,
}

impl TcpEndpoint {
    /// Bind the listening socket. Failure here is fatal for the bridge.
    pub async fn bind(address: &str) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: address.to_string(),
                source,
            })?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl EndpointListener for TcpEndpoint {
    type Stream = TcpTransportStream;

    async fn accept(&self) -> Result<(Self::Stream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((TcpTransportStream::new(stream), addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(endpoint.name(), "TCP");
        assert_ne!(endpoint.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = TcpEndpoint::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        let err = TcpEndpoint::bind(&addr).await.err().unwrap();
        assert!(matches!(err, BridgeError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_accept_peer() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").await.unwrap();
        let addr = endpoint.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (stream, peer) = endpoint.accept().await.unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        assert!(stream.inner.nodelay().unwrap());
    }
}
