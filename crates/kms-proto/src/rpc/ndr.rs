//! NDR conformant-array wrapping for the single KMS opnum.
//!
//! The KMS request/response payload is carried as an NDR conformant array of
//! bytes: a 4-byte little-endian max-count, the bytes themselves, then
//! padding to the next 4-byte boundary. Nothing else in the NDR
//! specification is needed here — KMS passes exactly one opaque byte array
//! per call.

use crate::bytecodec::{ByteReader, ByteWriter, Endian};
use crate::errors::{CodecError, Result};

/// Unwrap an NDR conformant byte array, returning the inner bytes.
///
/// `reader` must be positioned at the start of the max-count field; on
/// success it is left positioned just past the alignment padding.
pub fn read_conformant_bytes<'a>(reader: &mut ByteReader<'a>) -> Result<&'a [u8]> {
    let max_count = reader.read_u32(Endian::Little)?;
    let len = max_count as usize;
    if len > reader.remaining() {
        return Err(CodecError::InvalidNdrLength(max_count));
    }
    let bytes = reader.read_bytes(len)?;
    let pad = (4 - (len % 4)) % 4;
    if pad > 0 {
        reader.read_bytes(pad)?;
    }
    Ok(bytes)
}

/// Wrap `bytes` as an NDR conformant byte array, appending max-count,
/// payload, and 4-byte alignment padding.
pub fn write_conformant_bytes(writer: &mut ByteWriter, bytes: &[u8]) {
    writer.write_u32(bytes.len() as u32, Endian::Little);
    writer.write_bytes(bytes);
    let pad = (4 - (bytes.len() % 4)) % 4;
    for _ in 0..pad {
        writer.write_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_unaligned_payload() {
        let payload = [1u8, 2, 3, 4, 5];
        let mut w = ByteWriter::new();
        write_conformant_bytes(&mut w, &payload);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 4 + 5 + 3);

        let mut r = ByteReader::new(&bytes);
        let out = read_conformant_bytes(&mut r).unwrap();
        assert_eq!(out, &payload[..]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn round_trips_aligned_payload() {
        let payload = [1u8, 2, 3, 4];
        let mut w = ByteWriter::new();
        write_conformant_bytes(&mut w, &payload);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 4 + 4);

        let mut r = ByteReader::new(&bytes);
        let out = read_conformant_bytes(&mut r).unwrap();
        assert_eq!(out, &payload[..]);
    }

    #[test]
    fn rejects_length_larger_than_buffer() {
        let bytes = [0xFFu8, 0xFF, 0xFF, 0x7F, 1, 2];
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(read_conformant_bytes(&mut r), Err(CodecError::InvalidNdrLength(_))));
    }
}
