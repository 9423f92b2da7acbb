//! Error types for the cryptographic layer.

use thiserror::Error;

/// Errors produced while unwrapping a request or building a response's
/// cryptographic envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The plaintext recovered under this version's key didn't carry that
    /// version's tag — the caller guessed the wrong version, or the request
    /// is garbage.
    #[error("decrypted plaintext did not match the attempted version")]
    DecryptMismatch,

    /// A V4 hash or V6 HMAC trailer didn't match what the server computed.
    #[error("authentication check failed")]
    AuthFailure,

    /// A ciphertext/plaintext buffer wasn't a whole number of AES blocks.
    #[error("buffer length {0} is not a multiple of the AES block size")]
    UnalignedBuffer(usize),

    /// A buffer that should carry at least a salt/IV plus one block was too
    /// short to do so.
    #[error("buffer too short for cryptographic envelope: {0} bytes")]
    EnvelopeTooShort(usize),
}

/// Convenience alias for results from this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
