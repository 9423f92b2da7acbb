//! DCE/RPC connection-oriented framing: the layer between the raw TCP
//! stream and the KMS message bytes.

mod context;
mod ndr;
mod pdu;

pub use context::{
    negotiate_result, ContextResult, PresentationContext, PresentationResult, SyntaxId,
    KMS_ABSTRACT_SYNTAX, NDR_TRANSFER_SYNTAX,
};
pub use ndr::{read_conformant_bytes, write_conformant_bytes};
pub use pdu::{
    build_bind_ack, peek_header, split_response_fragments, CommonHeader, PduType, RpcPdu,
    HEADER_LEN, KMS_OPNUM, NCA_OP_RNG_ERROR, NCA_PROTO_ERROR, PFC_FIRST_FRAG, PFC_LAST_FRAG,
};
