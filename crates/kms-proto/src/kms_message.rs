//! The KMS request/response wire layout carried inside the RPC Request and
//! Response bodies (before/after cryptographic wrapping).
//!
//! This module knows nothing about AES, HMAC, or which version's key to use
//! — it only reads and writes the plaintext field layout from §4.3. Crypto
//! wrapping/unwrapping lives in `kms-crypto` and is applied by the caller
//! before/after these functions run.

use crate::bytecodec::{ByteReader, ByteWriter, Endian, Filetime, Guid};
use crate::errors::{CodecError, Result};

const MACHINE_NAME_BYTES: usize = 128;

/// KMS protocol major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KmsVersion {
    /// `0x0004_0000` — Windows Vista/7/Server 2008(R2) era, cleartext + hash.
    V4,
    /// `0x0005_0000` — Windows 8/Server 2012 era, CBC-wrapped.
    V5,
    /// `0x0006_0000` — Windows 8.1/10/Server 2012R2+ era, CBC + HMAC trailer.
    V6,
}

impl KmsVersion {
    /// Decode the 32-bit version tag.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0x0004_0000 => Ok(Self::V4),
            0x0005_0000 => Ok(Self::V5),
            0x0006_0000 => Ok(Self::V6),
            other => Err(CodecError::UnknownKmsVersion(other)),
        }
    }

    /// Encode back to the 32-bit wire tag.
    #[must_use]
    pub fn as_tag(self) -> u32 {
        match self {
            Self::V4 => 0x0004_0000,
            Self::V5 => 0x0005_0000,
            Self::V6 => 0x0006_0000,
        }
    }

    /// Plaintext size of the request body for this version, before padding.
    #[must_use]
    pub fn request_plaintext_len(self) -> usize {
        match self {
            Self::V4 | Self::V5 => 236,
            Self::V6 => 244,
        }
    }
}

/// A decoded KMS activation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsRequest {
    /// Protocol version this request was encoded under.
    pub version: KmsVersion,
    /// Non-zero if the requesting machine is a VM.
    pub is_client_vm: u32,
    /// Client-reported license status.
    pub license_status: u32,
    /// Minutes of grace period remaining on the client.
    pub grace_time: u32,
    /// Application (product family) GUID.
    pub application_id: Guid,
    /// SKU GUID identifying the exact product edition.
    pub sku_id: Guid,
    /// KMS-counted ID GUID (the GVLK activation object identifier).
    pub kms_counted_id: Guid,
    /// Client machine GUID.
    pub client_machine_id: Guid,
    /// Activation threshold the client believes it needs.
    pub required_client_count: u32,
    /// Client-stamped request time.
    pub request_time: Filetime,
    /// Previous client machine ID, if the client was re-imaged.
    pub previous_client_machine_id: Guid,
    /// NetBIOS machine name.
    pub machine_name: String,
    /// V6-only 8-byte hardware fingerprint the client reports.
    pub hw_info: Option<[u8; 8]>,
}

impl KmsRequest {
    /// Decode a request plaintext body (already version-unwrapped and
    /// un-padded by the crypto layer) for the given `version`.
    pub fn decode(version: KmsVersion, plaintext: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(plaintext);

        let tag = reader.read_u32(Endian::Little)?;
        let decoded_version = KmsVersion::from_tag(tag)?;
        if decoded_version != version {
            return Err(CodecError::UnknownKmsVersion(tag));
        }

        let is_client_vm = reader.read_u32(Endian::Little)?;
        let license_status = reader.read_u32(Endian::Little)?;
        let grace_time = reader.read_u32(Endian::Little)?;
        let application_id = reader.read_guid()?;
        let sku_id = reader.read_guid()?;
        let kms_counted_id = reader.read_guid()?;
        let client_machine_id = reader.read_guid()?;
        let required_client_count = reader.read_u32(Endian::Little)?;
        let request_time = reader.read_filetime()?;
        let previous_client_machine_id = reader.read_guid()?;
        let machine_name = reader.read_fixed_utf16le(MACHINE_NAME_BYTES)?;

        let hw_info = match version {
            KmsVersion::V6 => {
                let bytes = reader.read_bytes(8)?;
                Some(bytes.try_into().expect("invariant: read_bytes(8) returns 8 bytes"))
            }
            KmsVersion::V4 | KmsVersion::V5 => None,
        };

        Ok(Self {
            version,
            is_client_vm,
            license_status,
            grace_time,
            application_id,
            sku_id,
            kms_counted_id,
            client_machine_id,
            required_client_count,
            request_time,
            previous_client_machine_id,
            machine_name,
            hw_info,
        })
    }

    /// Encode to plaintext bytes (unpadded, unencrypted — the crypto layer
    /// pads and wraps this).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.version.request_plaintext_len());
        w.write_u32(self.version.as_tag(), Endian::Little);
        w.write_u32(self.is_client_vm, Endian::Little);
        w.write_u32(self.license_status, Endian::Little);
        w.write_u32(self.grace_time, Endian::Little);
        w.write_guid(&self.application_id);
        w.write_guid(&self.sku_id);
        w.write_guid(&self.kms_counted_id);
        w.write_guid(&self.client_machine_id);
        w.write_u32(self.required_client_count, Endian::Little);
        w.write_filetime(self.request_time);
        w.write_guid(&self.previous_client_machine_id);
        w.write_fixed_utf16le(&self.machine_name, MACHINE_NAME_BYTES);
        if let Some(hw_info) = self.hw_info {
            w.write_bytes(&hw_info);
        }
        w.into_bytes()
    }
}

/// A KMS activation response, ready for cryptographic wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsResponse {
    /// Echoes the request's version.
    pub version: KmsVersion,
    /// Echoes the request's client machine ID.
    pub client_machine_id: Guid,
    /// Echoes the request's `request_time`.
    pub response_time: Filetime,
    /// Reported current activation count.
    pub current_client_count: u32,
    /// Minutes until the client should retry activation.
    pub vl_activation_interval: u32,
    /// Minutes until the client should renew its activation.
    pub vl_renewal_interval: u32,
    /// The KMS host's EPID string.
    pub kms_epid: String,
    /// V6-only hardware ID echoed back to the client.
    pub hwid: Option<[u8; 8]>,
}

impl KmsResponse {
    /// Encode the fixed-layout plaintext fields (version through EPID). Does
    /// NOT include `randomSalt`, `hwid`, or the HMAC trailer — those are
    /// appended by `kms-crypto`'s V5/V6 wrapping, since they belong to the
    /// cryptographic envelope rather than the logical response record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut epid_units: Vec<u16> = self.kms_epid.encode_utf16().collect();
        epid_units.push(0); // NUL terminator
        let pid_size = (epid_units.len() * 2) as u16;

        let mut w = ByteWriter::with_capacity(42 + pid_size as usize);
        w.write_u32(self.version.as_tag(), Endian::Little);
        w.write_guid(&self.client_machine_id);
        w.write_filetime(self.response_time);
        w.write_u32(self.current_client_count, Endian::Little);
        w.write_u32(self.vl_activation_interval, Endian::Little);
        w.write_u32(self.vl_renewal_interval, Endian::Little);
        w.write_u16(pid_size, Endian::Little);
        for unit in epid_units {
            w.write_u16(unit, Endian::Little);
        }
        w.into_bytes()
    }

    /// Decode the fixed-layout plaintext fields from a buffer that may have
    /// trailing salt/hwid/HMAC bytes the caller has already stripped.
    pub fn decode(plaintext: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(plaintext);
        let tag = reader.read_u32(Endian::Little)?;
        let version = KmsVersion::from_tag(tag)?;
        let client_machine_id = reader.read_guid()?;
        let response_time = reader.read_filetime()?;
        let current_client_count = reader.read_u32(Endian::Little)?;
        let vl_activation_interval = reader.read_u32(Endian::Little)?;
        let vl_renewal_interval = reader.read_u32(Endian::Little)?;
        let pid_size = reader.read_u16(Endian::Little)?;
        let kms_epid = reader.read_fixed_utf16le(pid_size as usize)?;

        Ok(Self {
            version,
            client_machine_id,
            response_time,
            current_client_count,
            vl_activation_interval,
            vl_renewal_interval,
            kms_epid,
            hwid: None,
        })
    }
}
