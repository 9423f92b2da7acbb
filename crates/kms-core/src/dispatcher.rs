//! Request dispatch: the pure function connecting an RPC-layer request body
//! to a wrapped response body.
//!
//! Dispatch is pure given `(request bytes, ServerIdentity, persistence
//! handle, RNG)` — no hidden cross-request state beyond what the
//! persistence implementation itself records.

use kms_crypto::envelope::{unwrap_request, wrap_response};
use kms_crypto::CryptoError;
use kms_proto::errors::CodecError;
use kms_proto::{KmsRequest, KmsResponse, KmsVersion};
use thiserror::Error;

use crate::env::Environment;
use crate::identity::ServerIdentity;
use crate::persistence::{ClientRecord, Persistence, PersistenceError};

/// Errors from dispatching one KMS request.
///
/// The two variants get different connection-layer treatment: a
/// [`CryptoRejected`](Self::CryptoRejected) request must close the
/// connection without a reply (replying at all, even with a generic fault,
/// hands an attacker a decrypt/auth oracle), while
/// [`MalformedRequest`](Self::MalformedRequest) is safe to answer with a
/// Fault and keep the connection open, since the rejection happens only
/// after the request already authenticated under some version.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request didn't decrypt/authenticate cleanly under V4, V5, or V6
    /// (covers both a V4 hash mismatch / V6 HMAC mismatch and a plaintext
    /// that matched no version's tag).
    #[error("request failed decryption/authentication: {0}")]
    CryptoRejected(#[from] CryptoError),

    /// The request unwrapped cleanly but its field layout was malformed.
    #[error("malformed request body: {0}")]
    MalformedRequest(#[from] CodecError),
}

/// A successfully dispatched request: the wrapped response bytes and the
/// version they were wrapped under (useful for logging at the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Version the response was wrapped under (always equals the request's).
    pub version: KmsVersion,
    /// Wire-ready response body bytes (the RPC layer's NDR array payload).
    pub response_body: Vec<u8>,
    /// `true` if the persistence write failed; the response is still built
    /// and returned — persistence is advisory to activation.
    pub persistence_degraded: bool,
}

/// Run the full dispatch algorithm over one reassembled KMS request body.
pub fn dispatch<E: Environment>(
    body: &[u8],
    identity: &ServerIdentity,
    persistence: &dyn Persistence,
    env: &E,
) -> Result<DispatchOutcome, DispatchError> {
    let unwrapped = unwrap_request(body)?;
    let request = KmsRequest::decode(unwrapped.version, &unwrapped.plaintext)?;

    let record = ClientRecord {
        client_machine_id: request.client_machine_id,
        application_id: request.application_id,
        sku_id: request.sku_id,
        machine_name: request.machine_name.clone(),
        last_activation: request.request_time,
        activation_count: 1,
    };
    let persistence_degraded = persistence.upsert(record).is_err();

    let current_client_count =
        identity.max_clients.min(identity.current_client_count.max(request.required_client_count.saturating_add(1)));

    let year = 1970 + (env.wall_clock_secs() / (365 * 24 * 3600)) as u16;
    let epid = identity.epid_for(&request.application_id, year, env);

    let response = KmsResponse {
        version: request.version,
        client_machine_id: request.client_machine_id,
        response_time: request.request_time,
        current_client_count,
        vl_activation_interval: identity.vl_activation_interval,
        vl_renewal_interval: identity.vl_renewal_interval,
        kms_epid: epid,
        hwid: matches!(request.version, KmsVersion::V6).then_some(identity.hwid),
    };

    let mut plaintext = response.encode();
    if let Some(hwid) = response.hwid {
        plaintext.extend_from_slice(&hwid);
    }

    let salt = env.random_salt();
    let request_time_ticks = request.request_time.0;
    let response_body = wrap_response(response.version, &plaintext, salt, request_time_ticks);

    Ok(DispatchOutcome { version: request.version, response_body, persistence_degraded })
}

/// Helper for callers wanting to surface a degraded persistence write as a
/// distinct error without failing dispatch; not used by `dispatch` itself
/// (persistence failures there are swallowed per the error-handling design),
/// but kept for callers that want to log the underlying reason.
pub fn describe_persistence_error(err: &PersistenceError) -> String {
    err.to_string()
}
