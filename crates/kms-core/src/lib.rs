//! Protocol-level KMS domain logic.
//!
//! Sits between the wire codec (`kms-proto`), the cryptographic envelope
//! (`kms-crypto`), and the server binary (`kms-server`): this crate owns
//! the connection state machine, request dispatch, client persistence, and
//! server identity — everything that decides *what* a KMS server does,
//! independent of how bytes actually arrive over a socket.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connection;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod identity;
pub mod persistence;

pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
pub use dispatcher::{dispatch, DispatchError, DispatchOutcome};
pub use env::Environment;
pub use error::ConnectionError;
pub use identity::ServerIdentity;
pub use persistence::{ClientRecord, MemoryStore, Persistence, PersistenceError};
