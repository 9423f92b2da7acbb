//! Presentation context negotiation (the `p_context_elem`/`p_result_list`
//! pair exchanged during Bind/BindAck).

use crate::bytecodec::{ByteReader, ByteWriter, Endian, Guid};
use crate::errors::Result;

/// The KMS RPC interface UUID, version 1.0.
pub const KMS_ABSTRACT_SYNTAX: Guid = Guid {
    data1: 0x51C8_2175,
    data2: 0x844E,
    data3: 0x4750,
    data4: [0xB0, 0xD8, 0xEC, 0x25, 0x55, 0x55, 0xBC, 0x06],
};

/// NDR transfer syntax UUID, version 2.0.
pub const NDR_TRANSFER_SYNTAX: Guid = Guid {
    data1: 0x8A88_5D04,
    data2: 0x1CEB,
    data3: 0x11C9,
    data4: [0x9F, 0xE8, 0x08, 0x00, 0x2B, 0x10, 0x48, 0x60],
};

/// Outcome of negotiating one presentation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextResult {
    /// The context's syntaxes matched what this server implements.
    Acceptance,
    /// Anything else: abstract or transfer syntax not recognized.
    ProviderRejection,
}

impl ContextResult {
    fn as_u16(self) -> u16 {
        match self {
            Self::Acceptance => 0,
            Self::ProviderRejection => 2,
        }
    }
}

/// One syntax identifier: a UUID plus a (major, minor) version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    /// Interface or transfer-syntax UUID.
    pub uuid: Guid,
    /// Major version.
    pub version_major: u16,
    /// Minor version.
    pub version_minor: u16,
}

/// One `p_context_elem` entry from an incoming Bind PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    /// Context ID, echoed on every subsequent Request/Response.
    pub context_id: u16,
    /// Requested abstract (interface) syntax.
    pub abstract_syntax: SyntaxId,
    /// Transfer syntaxes offered, in client preference order.
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl PresentationContext {
    /// Decide whether this server accepts the context: the abstract syntax
    /// must be the KMS interface and at least one transfer syntax must be
    /// NDR.
    #[must_use]
    pub fn negotiate(&self) -> ContextResult {
        let abstract_ok = self.abstract_syntax.uuid == KMS_ABSTRACT_SYNTAX
            && self.abstract_syntax.version_major == 1
            && self.abstract_syntax.version_minor == 0;
        let transfer_ok = self
            .transfer_syntaxes
            .iter()
            .any(|s| s.uuid == NDR_TRANSFER_SYNTAX && s.version_major == 2);

        if abstract_ok && transfer_ok {
            ContextResult::Acceptance
        } else {
            ContextResult::ProviderRejection
        }
    }

    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let context_id = reader.read_u16(Endian::Little)?;
        let n_transfer = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let abstract_syntax = read_syntax_id(reader)?;
        let mut transfer_syntaxes = Vec::with_capacity(n_transfer as usize);
        for _ in 0..n_transfer {
            transfer_syntaxes.push(read_syntax_id(reader)?);
        }
        Ok(Self { context_id, abstract_syntax, transfer_syntaxes })
    }

    pub(crate) fn write(&self, writer: &mut ByteWriter) {
        writer.write_u16(self.context_id, Endian::Little);
        writer.write_u8(self.transfer_syntaxes.len() as u8);
        writer.write_u8(0);
        write_syntax_id(writer, &self.abstract_syntax);
        for ts in &self.transfer_syntaxes {
            write_syntax_id(writer, ts);
        }
    }
}

fn read_syntax_id(reader: &mut ByteReader<'_>) -> Result<SyntaxId> {
    let uuid = reader.read_guid()?;
    let version_major = reader.read_u16(Endian::Little)?;
    let version_minor = reader.read_u16(Endian::Little)?;
    Ok(SyntaxId { uuid, version_major, version_minor })
}

fn write_syntax_id(writer: &mut ByteWriter, id: &SyntaxId) {
    writer.write_guid(&id.uuid);
    writer.write_u16(id.version_major, Endian::Little);
    writer.write_u16(id.version_minor, Endian::Little);
}

/// One `p_result` entry in a BindAck's `p_result_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationResult {
    /// Negotiation outcome for the corresponding context.
    pub result: ContextResult,
    /// Transfer syntax chosen (only meaningful on acceptance).
    pub transfer_syntax: SyntaxId,
}

impl PresentationResult {
    pub(crate) fn write(&self, writer: &mut ByteWriter) {
        writer.write_u16(self.result.as_u16(), Endian::Little);
        writer.write_u16(0, Endian::Little); // reason, unused on acceptance path
        write_syntax_id(writer, &self.transfer_syntax);
    }
}

/// Build the result entry for a negotiated context.
#[must_use]
pub fn negotiate_result(ctx: &PresentationContext) -> PresentationResult {
    let result = ctx.negotiate();
    let transfer_syntax = match result {
        ContextResult::Acceptance => {
            SyntaxId { uuid: NDR_TRANSFER_SYNTAX, version_major: 2, version_minor: 0 }
        }
        ContextResult::ProviderRejection => {
            SyntaxId { uuid: Guid::NIL, version_major: 0, version_minor: 0 }
        }
    };
    PresentationResult { result, transfer_syntax }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kms_context(context_id: u16) -> PresentationContext {
        PresentationContext {
            context_id,
            abstract_syntax: SyntaxId { uuid: KMS_ABSTRACT_SYNTAX, version_major: 1, version_minor: 0 },
            transfer_syntaxes: vec![SyntaxId { uuid: NDR_TRANSFER_SYNTAX, version_major: 2, version_minor: 0 }],
        }
    }

    #[test]
    fn kms_context_is_accepted() {
        assert_eq!(kms_context(0).negotiate(), ContextResult::Acceptance);
    }

    #[test]
    fn wrong_abstract_syntax_is_rejected() {
        let mut ctx = kms_context(0);
        ctx.abstract_syntax.uuid = Guid::NIL;
        assert_eq!(ctx.negotiate(), ContextResult::ProviderRejection);
    }

    #[test]
    fn context_round_trips() {
        let ctx = kms_context(7);
        let mut w = ByteWriter::new();
        ctx.write(&mut w);
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        let parsed = PresentationContext::read(&mut r).unwrap();
        assert_eq!(parsed, ctx);
    }
}
