//! Cryptographic primitives for the KMS activation protocol.
//!
//! Three pieces: the raw [`aes_kernel`] block-cipher constructions KMS uses
//! in place of standard AEAD modes, the [`envelope`] layer that picks a
//! version and unwraps/wraps a whole request or response, and [`epid`]
//! which synthesizes the EPID/HWID fields that go inside a response.
//! Pure functions throughout — callers provide salts/IVs so behavior stays
//! deterministic and testable without an RNG.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aes_kernel;
pub mod envelope;
pub mod epid;
pub mod errors;
mod keys;

pub use envelope::{unwrap_request, wrap_response, UnwrappedRequest};
pub use errors::{CryptoError, Result};
pub use keys::{V4_KEY, V5_KEY, V6_KEY};
