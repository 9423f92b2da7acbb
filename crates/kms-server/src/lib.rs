//! KMS activation protocol server.
//!
//! Production server implementation using plain TCP for transport, Tokio for
//! the async runtime, and system time with cryptographic RNG.
//!
//! # Architecture
//!
//! This crate provides the production "glue" that wraps [`kms_core`]'s
//! action-based connection logic with real I/O. [`kms_core::Connection`]
//! follows the Sans-IO pattern (see that crate for details), while [`Server`]
//! executes its actions over a TCP socket via Tokio.
//!
//! # Components
//!
//! - [`Server`]: production runtime that accepts connections and drives each
//!   one through [`driver::serve_connection`]
//! - [`TcpTransport`]: TCP listener wrapper
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod system_env;
mod transport;

use std::sync::Arc;

pub use driver::{serve_connection, ServerConfig};
pub use error::ServerError;
use kms_core::{MemoryStore, ServerIdentity};
pub use system_env::SystemEnv;
use tokio::sync::Semaphore;
pub use transport::TcpTransport;

/// Runtime configuration for the production server.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Addresses to bind to (e.g., `["0.0.0.0:1688"]`, the well-known KMS
    /// port). One or more; each becomes its own `TcpListener`.
    pub bind_addresses: Vec<String>,
    /// Server identity reported to every client.
    pub identity: ServerIdentity,
    /// Driver configuration (timeouts, connection limits).
    pub driver: ServerConfig,
}

/// Production KMS server.
///
/// Wraps [`kms_core::Connection`] with one or more TCP transports and a
/// system environment. Every accepted connection is served in its own task,
/// regardless of which listener produced it; client persistence (activation
/// history) is shared across all of them through a single in-memory store.
pub struct Server {
    transports: Vec<TcpTransport>,
    identity: Arc<ServerIdentity>,
    persistence: Arc<MemoryStore>,
    env: SystemEnv,
    config: ServerConfig,
}

impl Server {
    /// Create and bind a new server across every address in
    /// `config.bind_addresses`.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.bind_addresses.is_empty() {
            return Err(ServerError::Config("at least one bind address is required".to_string()));
        }

        let mut transports = Vec::with_capacity(config.bind_addresses.len());
        for address in &config.bind_addresses {
            transports.push(TcpTransport::bind(address).await?);
        }

        Ok(Self {
            transports,
            identity: Arc::new(config.identity),
            persistence: Arc::new(MemoryStore::new()),
            env: SystemEnv::new(),
            config: config.driver,
        })
    }

    /// Local addresses the server is bound to, one per listener.
    pub fn local_addrs(&self) -> Result<Vec<std::net::SocketAddr>, ServerError> {
        self.transports.iter().map(TcpTransport::local_addr).collect()
    }

    /// Run the server, accepting connections on every bound address until
    /// the process is killed.
    ///
    /// Each listener gets its own accept-loop task; each accepted connection
    /// is then served on its own task in turn. A semaphore shared across all
    /// listeners caps concurrent connections at `config.driver.max_connections`;
    /// a connection accepted beyond that limit is closed immediately.
    pub async fn run(self) -> Result<(), ServerError> {
        for addr in self.local_addrs()? {
            tracing::info!("KMS server listening on {}", addr);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let mut accept_loops = tokio::task::JoinSet::new();

        for transport in self.transports {
            let identity = Arc::clone(&self.identity);
            let persistence = Arc::clone(&self.persistence);
            let env = self.env.clone();
            let connection_config = self.config.connection.clone();
            let permits = Arc::clone(&permits);

            accept_loops.spawn(async move {
                loop {
                    let (stream, peer) = match transport.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                            continue;
                        },
                    };

                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        tracing::warn!(%peer, "max connections reached, dropping connection");
                        drop(stream);
                        continue;
                    };

                    tracing::debug!(%peer, "accepted connection");

                    let identity = Arc::clone(&identity);
                    let persistence = Arc::clone(&persistence);
                    let env = env.clone();
                    let connection_config = connection_config.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = serve_connection(stream, identity, persistence, env, connection_config).await {
                            tracing::warn!(%peer, "connection error: {}", e);
                        }
                        tracing::debug!(%peer, "connection closed");
                    });
                }
            });
        }

        while let Some(result) = accept_loops.join_next().await {
            if let Err(e) = result {
                tracing::error!("accept loop task panicked: {}", e);
            }
        }

        Ok(())
    }
}
