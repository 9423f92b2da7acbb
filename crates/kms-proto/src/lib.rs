//! Wire codec for the KMS volume-activation protocol.
//!
//! Three layers, leaves first: [`bytecodec`] (primitive integer/string/GUID
//! packers), [`rpc`] (DCE/RPC connection-oriented PDU framing and NDR
//! wrapping), and [`kms_message`] (the KMS request/response field layout
//! carried inside an RPC body). None of these layers touch cryptography —
//! see the `kms-crypto` crate for the V4/V5/V6 wrapping applied to the raw
//! bytes `kms_message` produces and consumes.

pub mod bytecodec;
pub mod errors;
pub mod kms_message;
pub mod rpc;

pub use bytecodec::{ByteReader, ByteWriter, Endian, Filetime, Guid};
pub use errors::{CodecError, Result};
pub use kms_message::{KmsRequest, KmsResponse, KmsVersion};
