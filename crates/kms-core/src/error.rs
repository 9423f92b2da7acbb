//! Error types for the KMS protocol core.
//!
//! Strongly-typed errors for different layers: connection errors (framing,
//! timeouts) and transport errors (network failures).
//!
//! We avoid using `std::io::Error` for protocol logic to maintain type safety
//! and enable proper error handling and recovery.

use std::{io, time::Duration};

use kms_proto::errors::CodecError;
use thiserror::Error;

/// Errors that can occur while driving one connection's byte stream.
///
/// Unlike [`crate::dispatcher::DispatchError`], which covers one request's
/// payload and is recoverable with a Fault PDU, these errors mean the
/// connection itself cannot continue — the framing is desynchronized or the
/// peer has gone silent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// A PDU header or RPC-level field was malformed beyond what a Fault
    /// response can recover from (unsupported RPC version, unknown PDU
    /// type, truncated header).
    #[error("RPC framing error: {0}")]
    Framing(#[from] CodecError),

    /// No complete PDU arrived within the configured read timeout.
    #[error("read timeout after {elapsed:?}")]
    ReadTimeout {
        /// How long the connection waited for a complete PDU.
        elapsed: Duration,
    },

    /// Connection idle timeout exceeded (no bytes at all, not even a
    /// partial PDU, for the configured idle window).
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// How long the connection was idle.
        elapsed: Duration,
    },

    /// A PDU arrived out of sequence for the connection's current state
    /// (e.g. a Request before a Bind).
    #[error("unexpected PDU in state {state}")]
    UnexpectedPdu {
        /// Human-readable name of the state the PDU was rejected in.
        state: &'static str,
    },

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Transient errors are timeouts. Framing violations and out-of-sequence
    /// PDUs are never transient — they indicate a broken or malicious peer
    /// and the connection must close.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadTimeout { .. } | Self::IdleTimeout { .. })
    }
}

/// Convert `ConnectionError` to `io::Error` for compatibility with async I/O
/// APIs.
///
/// This is only for boundary conversion - internally we use `ConnectionError`.
impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let kind = match &err {
            ConnectionError::ReadTimeout { .. } | ConnectionError::IdleTimeout { .. } => {
                io::ErrorKind::TimedOut
            },
            ConnectionError::Framing(_) | ConnectionError::UnexpectedPdu { .. } => {
                io::ErrorKind::InvalidData
            },
            ConnectionError::Transport(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Convert `io::Error` to `ConnectionError` (for transport errors).
impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_are_transient() {
        assert!(ConnectionError::ReadTimeout { elapsed: Duration::from_secs(10) }.is_transient());
        assert!(ConnectionError::IdleTimeout { elapsed: Duration::from_secs(30) }.is_transient());
    }

    #[test]
    fn framing_and_sequencing_violations_are_fatal() {
        assert!(!ConnectionError::Framing(CodecError::UnknownPduType(0xFF)).is_transient());
        assert!(!ConnectionError::UnexpectedPdu { state: "AwaitingBind" }.is_transient());
        assert!(!ConnectionError::Transport("reset".to_string()).is_transient());
    }

    #[test]
    fn framing_error_maps_to_invalid_data() {
        let err: io::Error = ConnectionError::Framing(CodecError::UnknownOpnum(7)).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn idle_timeout_maps_to_timed_out() {
        let err: io::Error = ConnectionError::IdleTimeout { elapsed: Duration::from_secs(30) }.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
