//! Per-connection driver.
//!
//! Bridges a raw `TcpStream` to the Sans-IO [`Connection`] state machine:
//! reads bytes, feeds them to the connection, and writes back whatever
//! [`ConnectionAction`]s come out. Also owns the periodic timeout tick,
//! since the state machine itself has no notion of a clock running in the
//! background.

use std::sync::Arc;

use kms_core::{Connection, ConnectionAction, ConnectionConfig, Environment, Persistence, ServerIdentity};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ServerError;

/// Server-wide configuration shared by every accepted connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (timeouts, max fragment size).
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections. Beyond this, new connections are
    /// accepted and immediately closed.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { connection: ConnectionConfig::default(), max_connections: 10_000 }
    }
}

/// Read buffer size for one `TcpStream::read` call.
const READ_BUF_SIZE: usize = 8192;

/// Drive one accepted connection to completion.
///
/// Reads bytes from `stream`, feeds them to a fresh [`Connection`], and
/// writes out the resulting `SendBytes` actions until the peer disconnects,
/// a timeout fires, or a framing error forces the connection closed.
pub async fn serve_connection<E, P>(
    mut stream: TcpStream,
    identity: Arc<ServerIdentity>,
    persistence: Arc<P>,
    env: E,
    config: ConnectionConfig,
) -> Result<(), ServerError>
where
    E: Environment<Instant = std::time::Instant>,
    P: Persistence,
{
    let poll_interval = config.read_timeout.min(config.idle_timeout);
    let mut conn: Connection<std::time::Instant> = Connection::new(env.now(), config);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        match tokio::time::timeout(poll_interval, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                tracing::debug!("peer closed connection");
                break;
            },
            Ok(Ok(n)) => {
                let now = env.now();
                let actions = conn.on_bytes(&buf[..n], &identity, persistence.as_ref(), &env, now)?;
                if !write_actions(&mut stream, actions).await? {
                    break;
                }
            },
            Ok(Err(e)) => return Err(ServerError::from(e)),
            Err(_elapsed) => {
                let actions = conn.tick(env.now());
                if !write_actions(&mut stream, actions).await? {
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Write out `SendBytes` actions; returns `false` if a `Close` action means
/// the caller's read loop should stop.
async fn write_actions(
    stream: &mut TcpStream,
    actions: Vec<ConnectionAction>,
) -> Result<bool, ServerError> {
    for action in actions {
        match action {
            ConnectionAction::SendBytes(bytes) => {
                stream.write_all(&bytes).await?;
            },
            ConnectionAction::Close { reason } => {
                tracing::info!(%reason, "closing connection");
                return Ok(false);
            },
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kms_core::MemoryStore;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = std::time::Instant;

        fn now(&self) -> Self::Instant {
            std::time::Instant::now()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0x42);
        }

        fn wall_clock_secs(&self) -> u64 {
            1_769_000_000
        }
    }

    #[tokio::test]
    async fn idle_connection_is_closed_after_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            // Hold the socket open without sending anything.
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(stream);
        });

        let (stream, _) = listener.accept().await.unwrap();
        let identity = Arc::new(ServerIdentity::new([0; 8]));
        let persistence = Arc::new(MemoryStore::new());
        let config = ConnectionConfig {
            idle_timeout: Duration::from_millis(20),
            read_timeout: Duration::from_millis(20),
            ..ConnectionConfig::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(stream, identity, persistence, TestEnv, config),
        )
        .await;

        assert!(result.is_ok(), "serve_connection should return once idle-timed-out");
        client.await.unwrap();
    }
}
