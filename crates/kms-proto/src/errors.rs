//! Error types for the wire codec layer.

use thiserror::Error;

/// Errors produced while decoding or encoding protocol bytes.
///
/// These are purely structural — they never reflect cryptographic or
/// dispatch-level failures, which live in `kms-crypto` and `kms-core`
/// respectively.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes remained in the buffer to satisfy a read.
    #[error("short buffer: needed {needed} bytes, had {available}")]
    ShortBuffer {
        /// Bytes the read required.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A fixed-width field contained data after its logical terminator.
    #[error("malformed field: non-zero padding byte at offset {offset}")]
    MalformedField {
        /// Offset of the offending pad byte within the field.
        offset: usize,
    },

    /// A UTF-16LE field contained an unpaired surrogate or other invalid code unit.
    #[error("malformed field: invalid UTF-16 sequence")]
    InvalidUtf16,

    /// The RPC common header had a version other than 5.0.
    #[error("unsupported RPC version: {major}.{minor}")]
    UnsupportedRpcVersion {
        /// Major version read from the header.
        major: u8,
        /// Minor version read from the header.
        minor: u8,
    },

    /// The PDU type byte did not match any known PDU.
    #[error("unknown RPC PDU type: {0:#04x}")]
    UnknownPduType(u8),

    /// The RPC opnum in a Request PDU was not the single KMS opnum (0).
    #[error("unknown opnum: {0}")]
    UnknownOpnum(u16),

    /// A client set a non-zero auth_length; KMS never negotiates RPC auth.
    #[error("non-zero auth length: {0}")]
    NonZeroAuthLength(u16),

    /// The KMS request/response version tag did not match a known major version.
    #[error("unknown KMS version tag: {0:#010x}")]
    UnknownKmsVersion(u32),

    /// NDR conformant array claimed a length larger than the buffer holds.
    #[error("invalid NDR array length: {0}")]
    InvalidNdrLength(u32),
}

/// Convenience alias for results from this crate's codec functions.
pub type Result<T> = std::result::Result<T, CodecError>;
