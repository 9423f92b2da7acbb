//! DCE/RPC connection-oriented PDU framing.
//!
//! Covers exactly the PDU types KMS exchanges: Bind, BindAck, Request,
//! Response, and Fault. The common header is 16 bytes and precedes every
//! PDU body; `ptype` at offset 2 selects which body follows.

use crate::bytecodec::{ByteReader, ByteWriter, Endian};
use crate::errors::{CodecError, Result};
use crate::rpc::context::{negotiate_result, PresentationContext, PresentationResult};

/// PFC_FIRST_FRAG: this PDU carries the first fragment of a call.
pub const PFC_FIRST_FRAG: u8 = 0x01;
/// PFC_LAST_FRAG: this PDU carries the last fragment of a call.
pub const PFC_LAST_FRAG: u8 = 0x02;

/// `nca_op_rng_error`: Request named an opnum the interface doesn't define.
pub const NCA_OP_RNG_ERROR: u32 = 0x1C01_0002;
/// `nca_proto_error`: a protocol-layer violation (here: non-zero auth_length).
pub const NCA_PROTO_ERROR: u32 = 0x1C01_0001;

/// The single opnum the KMS interface exposes.
pub const KMS_OPNUM: u16 = 0;

/// Length of the common header preceding every PDU's type-specific body.
pub const HEADER_LEN: usize = 16;

/// PDU type tag, occupying byte offset 2 of the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    /// 0x00
    Request,
    /// 0x02
    Response,
    /// 0x03
    Fault,
    /// 0x0B
    Bind,
    /// 0x0C
    BindAck,
}

impl PduType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x00 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Fault),
            0x0B => Ok(Self::Bind),
            0x0C => Ok(Self::BindAck),
            other => Err(CodecError::UnknownPduType(other)),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Request => 0x00,
            Self::Response => 0x02,
            Self::Fault => 0x03,
            Self::Bind => 0x0B,
            Self::BindAck => 0x0C,
        }
    }
}

/// Common 16-byte header shared by every connection-oriented PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// PDU type.
    pub ptype: PduType,
    /// PFC_FIRST_FRAG / PFC_LAST_FRAG bitmask.
    pub pfc_flags: u8,
    /// Total length of this PDU including the header.
    pub frag_length: u16,
    /// Length of the trailing auth verifier; KMS never negotiates one.
    pub auth_length: u16,
    /// Caller-assigned call identifier, echoed on the response.
    pub call_id: u32,
}

impl CommonHeader {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let version_major = reader.read_u8()?;
        let version_minor = reader.read_u8()?;
        if version_major != 5 || version_minor != 0 {
            return Err(CodecError::UnsupportedRpcVersion { major: version_major, minor: version_minor });
        }
        let ptype = PduType::from_byte(reader.read_u8()?)?;
        let pfc_flags = reader.read_u8()?;
        let _data_representation = reader.read_bytes(4)?; // little-endian/ASCII/IEEE, fixed
        let frag_length = reader.read_u16(Endian::Little)?;
        let auth_length = reader.read_u16(Endian::Little)?;
        let call_id = reader.read_u32(Endian::Little)?;

        if auth_length != 0 {
            return Err(CodecError::NonZeroAuthLength(auth_length));
        }

        Ok(Self { ptype, pfc_flags, frag_length, auth_length, call_id })
    }

    fn write(&self, writer: &mut ByteWriter) {
        writer.write_u8(5);
        writer.write_u8(0);
        writer.write_u8(self.ptype.as_byte());
        writer.write_u8(self.pfc_flags);
        writer.write_bytes(&[0x10, 0x00, 0x00, 0x00]); // little-endian/ASCII/IEEE float
        writer.write_u16(self.frag_length, Endian::Little);
        writer.write_u16(self.auth_length, Endian::Little);
        writer.write_u32(self.call_id, Endian::Little);
    }

    /// Whether this PDU's flags mark it as both the first and only fragment.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pfc_flags & (PFC_FIRST_FRAG | PFC_LAST_FRAG) == (PFC_FIRST_FRAG | PFC_LAST_FRAG)
    }

    /// Whether PFC_FIRST_FRAG is set.
    #[must_use]
    pub fn is_first_frag(&self) -> bool {
        self.pfc_flags & PFC_FIRST_FRAG != 0
    }

    /// Whether PFC_LAST_FRAG is set.
    #[must_use]
    pub fn is_last_frag(&self) -> bool {
        self.pfc_flags & PFC_LAST_FRAG != 0
    }
}

/// A fully decoded or not-yet-encoded RPC PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcPdu {
    /// Client's connection-establishment request.
    Bind {
        /// Call identifier.
        call_id: u32,
        /// Largest fragment the client will accept from the server.
        max_xmit_frag: u16,
        /// Largest fragment the client will send.
        max_recv_frag: u16,
        /// Association group, `0` to request a fresh one.
        assoc_group_id: u32,
        /// Offered presentation contexts.
        contexts: Vec<PresentationContext>,
    },
    /// Server's Bind acknowledgement.
    BindAck {
        /// Call identifier, echoed from the Bind.
        call_id: u32,
        /// Server's maximum transmit fragment size.
        max_xmit_frag: u16,
        /// Server's maximum receive fragment size.
        max_recv_frag: u16,
        /// Association group (allocated if the client's request was zero).
        assoc_group_id: u32,
        /// Per-context negotiation results, in request order.
        results: Vec<PresentationResult>,
    },
    /// A method invocation.
    Request {
        /// Call identifier.
        call_id: u32,
        /// Presentation context this call is made under.
        context_id: u16,
        /// Operation number; KMS defines only opnum 0.
        opnum: u16,
        /// Whether this fragment is the first of the call.
        first_frag: bool,
        /// Whether this fragment is the last of the call.
        last_frag: bool,
        /// NDR-unwrapped request body bytes for this fragment.
        body: Vec<u8>,
    },
    /// A method's reply.
    Response {
        /// Call identifier, echoed from the Request.
        call_id: u32,
        /// Presentation context, echoed from the Request.
        context_id: u16,
        /// Whether this fragment is the first of the reply.
        first_frag: bool,
        /// Whether this fragment is the last of the reply.
        last_frag: bool,
        /// NDR-unwrapped response body bytes for this fragment.
        body: Vec<u8>,
    },
    /// A protocol-level failure.
    Fault {
        /// Call identifier the fault pertains to.
        call_id: u32,
        /// NCA status code.
        status: u32,
    },
}

/// Read just the 16-byte common header, without requiring the rest of the
/// PDU to be present yet. Callers reassembling a byte stream use this to
/// learn `frag_length` (and recover `call_id` for a Fault reply) before the
/// full PDU has arrived.
pub fn peek_header(buf: &[u8]) -> Result<CommonHeader> {
    let mut reader = ByteReader::new(buf);
    CommonHeader::read(&mut reader)
}

impl RpcPdu {
    /// Decode a single complete PDU from `buf`.
    ///
    /// `buf` must contain at least `frag_length` bytes (callers reassembling
    /// a stream should peek the header to learn `frag_length` before calling
    /// this). Returns the PDU and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let header = CommonHeader::read(&mut reader)?;
        let total = header.frag_length as usize;
        if buf.len() < total {
            return Err(CodecError::ShortBuffer { needed: total, available: buf.len() });
        }

        let pdu = match header.ptype {
            PduType::Bind => Self::decode_bind(&mut reader, &header)?,
            PduType::Request => Self::decode_request(&mut reader, &header)?,
            PduType::Fault => Self::decode_fault(&mut reader, &header)?,
            PduType::BindAck => Self::decode_bind_ack(&mut reader, &header)?,
            PduType::Response => Self::decode_response(&mut reader, &header)?,
        };

        Ok((pdu, total))
    }

    fn decode_bind(reader: &mut ByteReader<'_>, header: &CommonHeader) -> Result<Self> {
        let max_xmit_frag = reader.read_u16(Endian::Little)?;
        let max_recv_frag = reader.read_u16(Endian::Little)?;
        let assoc_group_id = reader.read_u32(Endian::Little)?;
        let n_context_elem = reader.read_u8()?;
        let _reserved = reader.read_bytes(3)?;
        let mut contexts = Vec::with_capacity(n_context_elem as usize);
        for _ in 0..n_context_elem {
            contexts.push(PresentationContext::read(reader)?);
        }
        Ok(Self::Bind { call_id: header.call_id, max_xmit_frag, max_recv_frag, assoc_group_id, contexts })
    }

    fn decode_bind_ack(reader: &mut ByteReader<'_>, header: &CommonHeader) -> Result<Self> {
        let max_xmit_frag = reader.read_u16(Endian::Little)?;
        let max_recv_frag = reader.read_u16(Endian::Little)?;
        let assoc_group_id = reader.read_u32(Endian::Little)?;
        let sec_addr_len = reader.read_u16(Endian::Little)?;
        let _sec_addr = reader.read_bytes(sec_addr_len as usize)?;
        let pad = (4 - ((2 + sec_addr_len as usize) % 4)) % 4;
        if pad > 0 {
            reader.read_bytes(pad)?;
        }
        let n_results = reader.read_u8()?;
        let _reserved = reader.read_bytes(3)?;
        let mut results = Vec::with_capacity(n_results as usize);
        for _ in 0..n_results {
            let result_code = reader.read_u16(Endian::Little)?;
            let _reason = reader.read_u16(Endian::Little)?;
            let uuid = reader.read_guid()?;
            let version_major = reader.read_u16(Endian::Little)?;
            let version_minor = reader.read_u16(Endian::Little)?;
            let result = if result_code == 0 {
                crate::rpc::context::ContextResult::Acceptance
            } else {
                crate::rpc::context::ContextResult::ProviderRejection
            };
            results.push(PresentationResult {
                result,
                transfer_syntax: crate::rpc::context::SyntaxId { uuid, version_major, version_minor },
            });
        }
        Ok(Self::BindAck { call_id: header.call_id, max_xmit_frag, max_recv_frag, assoc_group_id, results })
    }

    fn decode_request(reader: &mut ByteReader<'_>, header: &CommonHeader) -> Result<Self> {
        let _alloc_hint = reader.read_u32(Endian::Little)?;
        let context_id = reader.read_u16(Endian::Little)?;
        let opnum = reader.read_u16(Endian::Little)?;
        if opnum != KMS_OPNUM {
            return Err(CodecError::UnknownOpnum(opnum));
        }
        // Only the first fragment of a call carries the NDR max-count prefix;
        // continuation fragments are a raw tail of the byte array.
        let body = if header.is_first_frag() {
            crate::rpc::ndr::read_conformant_bytes(reader)?.to_vec()
        } else {
            reader.read_bytes(reader.remaining())?.to_vec()
        };
        Ok(Self::Request {
            call_id: header.call_id,
            context_id,
            opnum,
            first_frag: header.is_first_frag(),
            last_frag: header.is_last_frag(),
            body,
        })
    }

    fn decode_response(reader: &mut ByteReader<'_>, header: &CommonHeader) -> Result<Self> {
        let _alloc_hint = reader.read_u32(Endian::Little)?;
        let context_id = reader.read_u16(Endian::Little)?;
        let _cancel_count = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        // Only the first fragment of a call carries the NDR max-count prefix;
        // continuation fragments are a raw tail of the byte array.
        let body = if header.is_first_frag() {
            crate::rpc::ndr::read_conformant_bytes(reader)?.to_vec()
        } else {
            reader.read_bytes(reader.remaining())?.to_vec()
        };
        Ok(Self::Response {
            call_id: header.call_id,
            context_id,
            first_frag: header.is_first_frag(),
            last_frag: header.is_last_frag(),
            body,
        })
    }

    fn decode_fault(reader: &mut ByteReader<'_>, header: &CommonHeader) -> Result<Self> {
        let _alloc_hint = reader.read_u32(Endian::Little)?;
        let _context_id = reader.read_u16(Endian::Little)?;
        let _cancel_count = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let status = reader.read_u32(Endian::Little)?;
        Ok(Self::Fault { call_id: header.call_id, status })
    }

    /// Encode this PDU to wire bytes, computing `frag_length` automatically.
    ///
    /// For `Request`/`Response` bodies larger than `max_frag`, callers should
    /// use [`split_response_fragments`] instead; this method always sets
    /// both PFC_FIRST_FRAG and PFC_LAST_FRAG.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body_writer = ByteWriter::new();
        let (ptype, call_id) = self.encode_body(&mut body_writer);
        let body = body_writer.into_bytes();

        let mut writer = ByteWriter::with_capacity(HEADER_LEN + body.len());
        let header = CommonHeader {
            ptype,
            pfc_flags: PFC_FIRST_FRAG | PFC_LAST_FRAG,
            frag_length: (HEADER_LEN + body.len()) as u16,
            auth_length: 0,
            call_id,
        };
        header.write(&mut writer);
        writer.write_bytes(&body);
        writer.into_bytes()
    }

    fn encode_body(&self, writer: &mut ByteWriter) -> (PduType, u32) {
        match self {
            Self::Bind { call_id, max_xmit_frag, max_recv_frag, assoc_group_id, contexts } => {
                writer.write_u16(*max_xmit_frag, Endian::Little);
                writer.write_u16(*max_recv_frag, Endian::Little);
                writer.write_u32(*assoc_group_id, Endian::Little);
                writer.write_u8(contexts.len() as u8);
                writer.write_bytes(&[0, 0, 0]);
                for ctx in contexts {
                    ctx.write(writer);
                }
                (PduType::Bind, *call_id)
            }
            Self::BindAck { call_id, max_xmit_frag, max_recv_frag, assoc_group_id, results } => {
                writer.write_u16(*max_xmit_frag, Endian::Little);
                writer.write_u16(*max_recv_frag, Endian::Little);
                writer.write_u32(*assoc_group_id, Endian::Little);
                let sec_addr = b"135\0";
                writer.write_u16(sec_addr.len() as u16, Endian::Little);
                writer.write_bytes(sec_addr);
                let pad = (4 - ((2 + sec_addr.len()) % 4)) % 4;
                for _ in 0..pad {
                    writer.write_u8(0);
                }
                writer.write_u8(results.len() as u8);
                writer.write_bytes(&[0, 0, 0]);
                for res in results {
                    res.write(writer);
                }
                (PduType::BindAck, *call_id)
            }
            Self::Request { call_id, context_id, opnum, body, .. } => {
                writer.write_u32(body.len() as u32, Endian::Little);
                writer.write_u16(*context_id, Endian::Little);
                writer.write_u16(*opnum, Endian::Little);
                crate::rpc::ndr::write_conformant_bytes(writer, body);
                (PduType::Request, *call_id)
            }
            Self::Response { call_id, context_id, body, .. } => {
                writer.write_u32(body.len() as u32, Endian::Little);
                writer.write_u16(*context_id, Endian::Little);
                writer.write_u8(0); // cancel count
                writer.write_u8(0); // reserved
                crate::rpc::ndr::write_conformant_bytes(writer, body);
                (PduType::Response, *call_id)
            }
            Self::Fault { call_id, status } => {
                writer.write_u32(0, Endian::Little); // alloc hint
                writer.write_u16(0, Endian::Little); // context id
                writer.write_u8(0); // cancel count
                writer.write_u8(0); // reserved
                writer.write_u32(*status, Endian::Little);
                (PduType::Fault, *call_id)
            }
        }
    }
}

/// Build the BindAck PDU answering an incoming Bind.
#[must_use]
pub fn build_bind_ack(bind_call_id: u32, max_xmit_frag: u16, max_recv_frag: u16, assoc_group_id: u32, contexts: &[PresentationContext]) -> RpcPdu {
    let results = contexts.iter().map(negotiate_result).collect();
    RpcPdu::BindAck { call_id: bind_call_id, max_xmit_frag, max_recv_frag, assoc_group_id, results }
}

/// Split a Response body into PDU fragments no larger than `max_frag` bytes
/// of payload each, preserving `call_id` and `context_id` across fragments.
#[must_use]
pub fn split_response_fragments(call_id: u32, context_id: u16, body: &[u8], max_frag: usize) -> Vec<Vec<u8>> {
    let chunk_cap = max_frag.saturating_sub(HEADER_LEN + 8).max(1);
    let chunks: Vec<&[u8]> = if body.is_empty() { vec![&body[..0]] } else { body.chunks(chunk_cap).collect() };
    let last_idx = chunks.len() - 1;

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut writer = ByteWriter::with_capacity(HEADER_LEN + 8 + chunk.len() + 4);
            let mut flags = 0u8;
            if i == 0 {
                flags |= PFC_FIRST_FRAG;
            }
            if i == last_idx {
                flags |= PFC_LAST_FRAG;
            }

            let mut body_writer = ByteWriter::new();
            body_writer.write_u32(body.len() as u32, Endian::Little);
            body_writer.write_u16(context_id, Endian::Little);
            body_writer.write_u8(0);
            body_writer.write_u8(0);
            if i == 0 {
                crate::rpc::ndr::write_conformant_bytes(&mut body_writer, chunk);
            } else {
                body_writer.write_bytes(chunk);
            }
            let body_bytes = body_writer.into_bytes();

            let header = CommonHeader {
                ptype: PduType::Response,
                pfc_flags: flags,
                frag_length: (HEADER_LEN + body_bytes.len()) as u16,
                auth_length: 0,
                call_id,
            };
            header.write(&mut writer);
            writer.write_bytes(&body_bytes);
            writer.into_bytes()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::context::{ContextResult, SyntaxId, KMS_ABSTRACT_SYNTAX, NDR_TRANSFER_SYNTAX};

    fn kms_context() -> PresentationContext {
        PresentationContext {
            context_id: 0,
            abstract_syntax: SyntaxId { uuid: KMS_ABSTRACT_SYNTAX, version_major: 1, version_minor: 0 },
            transfer_syntaxes: vec![SyntaxId { uuid: NDR_TRANSFER_SYNTAX, version_major: 2, version_minor: 0 }],
        }
    }

    #[test]
    fn bind_round_trips() {
        let pdu = RpcPdu::Bind {
            call_id: 1,
            max_xmit_frag: 4280,
            max_recv_frag: 4280,
            assoc_group_id: 0,
            contexts: vec![kms_context()],
        };
        let bytes = pdu.encode();
        let (decoded, consumed) = RpcPdu::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn bind_ack_accepts_kms_context() {
        let ack = build_bind_ack(1, 4280, 4280, 0x1234, &[kms_context()]);
        let bytes = ack.encode();
        let (decoded, _) = RpcPdu::decode(&bytes).unwrap();
        match decoded {
            RpcPdu::BindAck { results, .. } => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].result, ContextResult::Acceptance);
            }
            other => panic!("expected BindAck, got {other:?}"),
        }
    }

    #[test]
    fn request_round_trips_with_ndr_body() {
        let body = vec![0xAAu8; 236];
        let pdu = RpcPdu::Request { call_id: 0x42, context_id: 0, opnum: 0, first_frag: true, last_frag: true, body: body.clone() };
        let bytes = pdu.encode();
        let (decoded, _) = RpcPdu::decode(&bytes).unwrap();
        assert_eq!(decoded, pdu);
        if let RpcPdu::Request { body: decoded_body, .. } = decoded {
            assert_eq!(decoded_body, body);
        }
    }

    #[test]
    fn unknown_opnum_errors() {
        let mut writer = ByteWriter::new();
        writer.write_u32(4, Endian::Little);
        writer.write_u16(0, Endian::Little);
        writer.write_u16(1, Endian::Little); // opnum = 1
        crate::rpc::ndr::write_conformant_bytes(&mut writer, &[1, 2, 3, 4]);
        let body = writer.into_bytes();

        let mut full = ByteWriter::new();
        let header =
            CommonHeader { ptype: PduType::Request, pfc_flags: PFC_FIRST_FRAG | PFC_LAST_FRAG, frag_length: (HEADER_LEN + body.len()) as u16, auth_length: 0, call_id: 1 };
        header.write(&mut full);
        full.write_bytes(&body);

        assert!(matches!(RpcPdu::decode(&full.into_bytes()), Err(CodecError::UnknownOpnum(1))));
    }

    #[test]
    fn non_zero_auth_length_errors() {
        let mut full = ByteWriter::new();
        let header = CommonHeader { ptype: PduType::Bind, pfc_flags: PFC_FIRST_FRAG | PFC_LAST_FRAG, frag_length: 16, auth_length: 8, call_id: 1 };
        header.write(&mut full);
        assert!(matches!(RpcPdu::decode(&full.into_bytes()), Err(CodecError::NonZeroAuthLength(8))));
    }

    #[test]
    fn fault_round_trips() {
        let pdu = RpcPdu::Fault { call_id: 7, status: NCA_OP_RNG_ERROR };
        let bytes = pdu.encode();
        let (decoded, _) = RpcPdu::decode(&bytes).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn split_response_preserves_call_id_and_reassembles() {
        let body = vec![7u8; 500];
        let frags = split_response_fragments(0x42, 0, &body, 128);
        assert!(frags.len() > 1);

        let mut reassembled = Vec::new();
        for (i, frag) in frags.iter().enumerate() {
            let (pdu, _) = RpcPdu::decode(frag).unwrap();
            if let RpcPdu::Response { call_id, first_frag, last_frag, body: chunk, .. } = pdu {
                assert_eq!(call_id, 0x42);
                assert_eq!(first_frag, i == 0);
                assert_eq!(last_frag, i == frags.len() - 1);
                reassembled.extend_from_slice(&chunk);
            } else {
                panic!("expected Response fragment");
            }
        }
        assert_eq!(reassembled, body);
    }
}
