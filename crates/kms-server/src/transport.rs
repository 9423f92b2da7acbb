//! TCP transport implementation.
//!
//! KMS activation runs as plain DCE/RPC over TCP — there is no TLS layer in
//! the real protocol (volume-license clients reach port 1688 directly), so
//! this transport is a thin wrapper over `tokio::net::TcpListener` rather
//! than the encrypted/multiplexed transport a session protocol would need.
//!
//! # Capabilities
//!
//! - TCP accept loop producing one stream per incoming connection
//! - No multiplexing: one DCE/RPC connection maps to exactly one `TcpStream`

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::ServerError;

/// TCP transport for the KMS RPC endpoint.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a new TCP listener on `address` (e.g. `"0.0.0.0:1688"`).
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind '{address}': {e}")))?;

        tracing::info!("TCP transport bound to {}", address);

        Ok(Self { listener })
    }

    /// Accept a new TCP connection, yielding the stream and the peer's
    /// address.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_binds_to_ephemeral_port() {
        let transport = TcpTransport::bind("127.0.0.1:0").await;
        assert!(transport.is_ok(), "transport should bind on an ephemeral port");

        let transport = transport.unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0, "should have assigned a port");
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        let result = TcpTransport::bind("invalid:address:format").await;
        assert!(result.is_err(), "should reject invalid address");
    }

    #[tokio::test]
    async fn accept_yields_peer_address() {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (_, peer) = transport.accept().await.unwrap();
        assert_eq!(peer.ip(), addr.ip());

        client.await.unwrap();
    }
}
