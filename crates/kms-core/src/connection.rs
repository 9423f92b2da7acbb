//! Connection-layer state machine.
//!
//! Drives one TCP connection's byte stream through DCE/RPC Bind, then
//! accepts fragmented Request PDUs, dispatches each complete call, and
//! emits the wrapped Response (or Fault) fragments. Uses the action
//! pattern: methods take bytes/time as input and return actions for the
//! driver to execute. This keeps the state machine pure (no I/O) and makes
//! testing straightforward.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────────┐   Bind    ┌───────┐
//! │ AwaitingBind  │──────────>│ Bound │
//! └───────────────┘           └───────┘
//!        │                        │
//!        │ timeout/framing error  │ timeout/framing error
//!        ↓                        ↓
//!                  ┌────────┐
//!                  │ Closed │
//!                  └────────┘
//! ```

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use kms_proto::errors::CodecError;
use kms_proto::rpc::{build_bind_ack, peek_header, split_response_fragments, RpcPdu, HEADER_LEN, NCA_OP_RNG_ERROR, NCA_PROTO_ERROR};

use crate::dispatcher::{dispatch, DispatchError};
use crate::env::Environment;
use crate::error::ConnectionError;
use crate::identity::ServerIdentity;
use crate::persistence::Persistence;

/// Maximum time allowed without any activity before the connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum time allowed for a partially-received PDU to complete.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ceiling on fragment size for outgoing Response PDUs, matching
/// the fragment size KMS clients themselves offer in their Bind.
pub const DEFAULT_MAX_XMIT_FRAG: usize = 4280;

/// Actions returned by the connection state machine.
///
/// The driver (test harness or production server) executes these actions:
/// - `SendBytes`: write these bytes to the socket verbatim
/// - `Close`: close the connection with the given reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send these already-framed bytes to the peer.
    SendBytes(Vec<u8>),

    /// Close the connection with this reason.
    Close {
        /// Reason for closing the connection.
        reason: String,
    },
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No Bind received yet.
    AwaitingBind,
    /// Bind accepted; Request/Response calls may proceed.
    Bound,
    /// Connection closed (graceful or error).
    Closed,
}

impl ConnectionState {
    fn name(self) -> &'static str {
        match self {
            Self::AwaitingBind => "AwaitingBind",
            Self::Bound => "Bound",
            Self::Closed => "Closed",
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout before disconnecting (no bytes at all).
    pub idle_timeout: Duration,
    /// How long a partially-received PDU may sit incomplete.
    pub read_timeout: Duration,
    /// Ceiling on fragment size used when splitting outgoing Responses.
    pub max_xmit_frag: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_xmit_frag: DEFAULT_MAX_XMIT_FRAG,
        }
    }
}

/// A Request call whose fragments are still being reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRequest {
    call_id: u32,
    context_id: u16,
    body: Vec<u8>,
}

/// Connection state machine.
///
/// Manages lifecycle, timeouts, and PDU reassembly for a single connection.
///
/// This is a pure state machine - no I/O, no Environment storage beyond
/// what's passed to [`Connection::on_bytes`]. Time is passed as parameters
/// to methods that need it.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: I,
    partial_since: Option<I>,
    recv_buf: Vec<u8>,
    pending: Option<PendingRequest>,
    negotiated_max_frag: usize,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::AwaitingBind`] state.
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        let negotiated_max_frag = config.max_xmit_frag;
        Self {
            state: ConnectionState::AwaitingBind,
            config,
            last_activity: now,
            partial_since: None,
            recv_buf: Vec::new(),
            pending: None,
            negotiated_max_frag,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Mark connection as closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Elapsed time past whichever timeout applies, if any; `None` otherwise.
    #[must_use]
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        let idle_elapsed = now - self.last_activity;
        if idle_elapsed > self.config.idle_timeout {
            return Some(idle_elapsed);
        }
        if let Some(since) = self.partial_since {
            let read_elapsed = now - since;
            if read_elapsed > self.config.read_timeout {
                return Some(read_elapsed);
            }
        }
        None
    }

    /// Check timers and close the connection if either has lapsed.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        let Some(elapsed) = self.check_timeout(now) else {
            return vec![];
        };
        let reason = if self.partial_since.is_some() && elapsed <= self.config.idle_timeout {
            format!("read timeout after {elapsed:?}")
        } else {
            format!("idle timeout after {elapsed:?}")
        };
        self.state = ConnectionState::Closed;
        vec![ConnectionAction::Close { reason }]
    }

    /// Feed newly-received bytes into the connection, decoding and acting on
    /// as many complete PDUs as the buffer now holds.
    ///
    /// # Errors
    ///
    /// Returns `Err` (and transitions to `Closed`) on unrecoverable framing
    /// errors or PDUs out of sequence for the current state. Recoverable
    /// per-call errors (unknown opnum, non-zero auth length, a malformed but
    /// decryptable request) instead produce a Fault `SendBytes` action and
    /// the connection stays open. A request that fails decryption or
    /// authentication under every known version closes the connection
    /// without any reply at all, rather than a Fault — replying would let an
    /// attacker distinguish "wrong version" from "wrong key" one probe at a
    /// time.
    pub fn on_bytes<E: Environment>(
        &mut self,
        bytes: &[u8],
        identity: &ServerIdentity,
        persistence: &dyn Persistence,
        env: &E,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(vec![]);
        }

        self.last_activity = now;
        self.recv_buf.extend_from_slice(bytes);
        if self.partial_since.is_none() && !self.recv_buf.is_empty() {
            self.partial_since = Some(now);
        }

        let mut actions = Vec::new();
        loop {
            if self.recv_buf.len() < HEADER_LEN {
                break;
            }

            let header = match peek_header(&self.recv_buf) {
                Ok(header) => header,
                Err(CodecError::NonZeroAuthLength(_)) => {
                    let Some((frag_len, call_id)) = raw_header_fields(&self.recv_buf) else { break };
                    let total = (frag_len as usize).max(HEADER_LEN).min(self.recv_buf.len());
                    self.recv_buf.drain(..total);
                    actions.push(ConnectionAction::SendBytes(
                        RpcPdu::Fault { call_id, status: NCA_PROTO_ERROR }.encode(),
                    ));
                    continue;
                }
                Err(err) => {
                    self.state = ConnectionState::Closed;
                    return Err(ConnectionError::Framing(err));
                }
            };

            let total = header.frag_length as usize;
            if self.recv_buf.len() < total {
                break;
            }

            let pdu = match RpcPdu::decode(&self.recv_buf) {
                Ok((pdu, _consumed)) => pdu,
                Err(CodecError::UnknownOpnum(_)) => {
                    self.recv_buf.drain(..total);
                    actions.push(ConnectionAction::SendBytes(
                        RpcPdu::Fault { call_id: header.call_id, status: NCA_OP_RNG_ERROR }.encode(),
                    ));
                    continue;
                }
                Err(err) => {
                    self.state = ConnectionState::Closed;
                    return Err(ConnectionError::Framing(err));
                }
            };
            self.recv_buf.drain(..total);

            actions.extend(self.handle_pdu(pdu, identity, persistence, env)?);
        }

        if self.recv_buf.is_empty() {
            self.partial_since = None;
        }

        Ok(actions)
    }

    fn handle_pdu<E: Environment>(
        &mut self,
        pdu: RpcPdu,
        identity: &ServerIdentity,
        persistence: &dyn Persistence,
        env: &E,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        match pdu {
            RpcPdu::Bind { call_id, max_xmit_frag, max_recv_frag, assoc_group_id, contexts } => {
                if self.state != ConnectionState::AwaitingBind {
                    self.state = ConnectionState::Closed;
                    return Err(ConnectionError::UnexpectedPdu { state: self.state.name() });
                }
                self.negotiated_max_frag = self.config.max_xmit_frag.min(max_recv_frag as usize).max(HEADER_LEN + 32);
                let ack = build_bind_ack(call_id, max_xmit_frag, max_recv_frag, assoc_group_id.max(1), &contexts);
                self.state = ConnectionState::Bound;
                Ok(vec![ConnectionAction::SendBytes(ack.encode())])
            }

            RpcPdu::Request { call_id, context_id, first_frag, last_frag, body, .. } => {
                if self.state != ConnectionState::Bound {
                    self.state = ConnectionState::Closed;
                    return Err(ConnectionError::UnexpectedPdu { state: self.state.name() });
                }

                if first_frag {
                    self.pending = Some(PendingRequest { call_id, context_id, body });
                } else if let Some(pending) = self.pending.as_mut() {
                    pending.body.extend_from_slice(&body);
                } else {
                    // Continuation fragment with nothing to continue; drop it silently,
                    // mirroring how a desynchronized call simply never completes.
                    return Ok(vec![]);
                }

                if !last_frag {
                    return Ok(vec![]);
                }

                let Some(request) = self.pending.take() else { return Ok(vec![]) };
                match dispatch(&request.body, identity, persistence, env) {
                    Ok(outcome) => Ok(split_response_fragments(request.call_id, request.context_id, &outcome.response_body, self.negotiated_max_frag)
                        .into_iter()
                        .map(ConnectionAction::SendBytes)
                        .collect()),
                    Err(DispatchError::MalformedRequest(_)) => {
                        Ok(vec![ConnectionAction::SendBytes(RpcPdu::Fault { call_id: request.call_id, status: NCA_PROTO_ERROR }.encode())])
                    }
                    Err(DispatchError::CryptoRejected(_)) => {
                        // Closing silently here (no Fault) is load-bearing: a reply of
                        // any shape tells a probing client whether its guess decrypted,
                        // turning this path into a decrypt/auth oracle.
                        self.state = ConnectionState::Closed;
                        Ok(vec![ConnectionAction::Close { reason: "request failed decryption/authentication check".to_string() }])
                    }
                }
            }

            RpcPdu::BindAck { .. } | RpcPdu::Response { .. } | RpcPdu::Fault { .. } => {
                self.state = ConnectionState::Closed;
                Err(ConnectionError::UnexpectedPdu { state: self.state.name() })
            }
        }
    }
}

/// Read `frag_length` (offset 8, u16 LE) and `call_id` (offset 12, u32 LE)
/// directly from the fixed header layout, bypassing full validation. Used
/// only to build a Fault reply (or skip a malformed PDU) when the strict
/// parser has already rejected the header for a business-rule reason.
fn raw_header_fields(buf: &[u8]) -> Option<(u16, u32)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let frag_len = u16::from_le_bytes(buf[8..10].try_into().ok()?);
    let call_id = u32::from_le_bytes(buf[12..16].try_into().ok()?);
    Some((frag_len, call_id))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kms_crypto::envelope::wrap_v4_response;
    use kms_proto::bytecodec::{Filetime, Guid};
    use kms_proto::rpc::{PresentationContext, SyntaxId, KMS_ABSTRACT_SYNTAX, NDR_TRANSFER_SYNTAX};
    use kms_proto::{KmsRequest, KmsVersion};

    use super::*;
    use crate::persistence::MemoryStore;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0x42);
        }

        fn wall_clock_secs(&self) -> u64 {
            1_769_000_000
        }
    }

    fn kms_context() -> PresentationContext {
        PresentationContext {
            context_id: 0,
            abstract_syntax: SyntaxId { uuid: KMS_ABSTRACT_SYNTAX, version_major: 1, version_minor: 0 },
            transfer_syntaxes: vec![SyntaxId { uuid: NDR_TRANSFER_SYNTAX, version_major: 2, version_minor: 0 }],
        }
    }

    fn bind_bytes(call_id: u32) -> Vec<u8> {
        RpcPdu::Bind { call_id, max_xmit_frag: 4280, max_recv_frag: 4280, assoc_group_id: 0, contexts: vec![kms_context()] }.encode()
    }

    fn request_bytes(call_id: u32) -> Vec<u8> {
        let req = KmsRequest {
            version: KmsVersion::V4,
            is_client_vm: 0,
            license_status: 2,
            grace_time: 43200,
            application_id: Guid::parse("55c92734-d682-4d71-983e-d6ec3f16059f").unwrap(),
            sku_id: Guid::parse("ae2ee509-1b34-41c0-acb7-6d4650168915").unwrap(),
            kms_counted_id: Guid::NIL,
            client_machine_id: Guid::parse("11111111-2222-3333-4444-555555555555").unwrap(),
            required_client_count: 25,
            request_time: Filetime::from_unix_secs(1_700_000_000),
            previous_client_machine_id: Guid::NIL,
            machine_name: "TESTPC".to_string(),
            hw_info: None,
        };
        let wrapped = wrap_v4_response(&req.encode());
        RpcPdu::Request { call_id, context_id: 0, opnum: 0, first_frag: true, last_frag: true, body: wrapped }.encode()
    }

    #[test]
    fn bind_transitions_to_bound() {
        let env = TestEnv;
        let t0 = env.now();
        let identity = ServerIdentity::new([0; 8]);
        let persistence = MemoryStore::new();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig::default());

        assert_eq!(conn.state(), ConnectionState::AwaitingBind);
        let actions = conn.on_bytes(&bind_bytes(1), &identity, &persistence, &env, t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ConnectionAction::SendBytes(_)));
    }

    #[test]
    fn request_before_bind_closes_connection() {
        let env = TestEnv;
        let t0 = env.now();
        let identity = ServerIdentity::new([0; 8]);
        let persistence = MemoryStore::new();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig::default());

        let result = conn.on_bytes(&request_bytes(1), &identity, &persistence, &env, t0);
        assert!(matches!(result, Err(ConnectionError::UnexpectedPdu { .. })));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn bound_request_dispatches_and_responds() {
        let env = TestEnv;
        let t0 = env.now();
        let identity = ServerIdentity::new([0; 8]);
        let persistence = MemoryStore::new();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig::default());

        conn.on_bytes(&bind_bytes(1), &identity, &persistence, &env, t0).unwrap();
        let actions = conn.on_bytes(&request_bytes(2), &identity, &persistence, &env, t0).unwrap();

        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ConnectionAction::SendBytes(bytes) => {
                let (pdu, _) = RpcPdu::decode(bytes).unwrap();
                assert!(matches!(pdu, RpcPdu::Response { .. }));
            }
            other => panic!("expected SendBytes, got {other:?}"),
        }
        assert_eq!(persistence.list().unwrap().len(), 1);
    }

    #[test]
    fn request_split_across_two_chunks_still_dispatches() {
        let env = TestEnv;
        let t0 = env.now();
        let identity = ServerIdentity::new([0; 8]);
        let persistence = MemoryStore::new();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig::default());

        conn.on_bytes(&bind_bytes(1), &identity, &persistence, &env, t0).unwrap();

        let full = request_bytes(2);
        let (first, second) = full.split_at(full.len() / 2);
        let actions_1 = conn.on_bytes(first, &identity, &persistence, &env, t0).unwrap();
        assert!(actions_1.is_empty());
        let actions_2 = conn.on_bytes(second, &identity, &persistence, &env, t0).unwrap();
        assert_eq!(actions_2.len(), 1);
    }

    #[test]
    fn unknown_opnum_yields_fault_and_stays_open() {
        let env = TestEnv;
        let t0 = env.now();
        let identity = ServerIdentity::new([0; 8]);
        let persistence = MemoryStore::new();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig::default());
        conn.on_bytes(&bind_bytes(1), &identity, &persistence, &env, t0).unwrap();

        let bad_request =
            RpcPdu::Request { call_id: 2, context_id: 0, opnum: 1, first_frag: true, last_frag: true, body: vec![1, 2, 3, 4] }.encode();

        let actions = conn.on_bytes(&bad_request, &identity, &persistence, &env, t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ConnectionAction::SendBytes(bytes) => {
                let (pdu, _) = RpcPdu::decode(bytes).unwrap();
                assert!(matches!(pdu, RpcPdu::Fault { status, .. } if status == NCA_OP_RNG_ERROR));
            }
            other => panic!("expected SendBytes, got {other:?}"),
        }
    }

    #[test]
    fn undecryptable_request_closes_connection_without_reply() {
        let env = TestEnv;
        let t0 = env.now();
        let identity = ServerIdentity::new([0; 8]);
        let persistence = MemoryStore::new();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig::default());
        conn.on_bytes(&bind_bytes(1), &identity, &persistence, &env, t0).unwrap();

        let garbage = vec![0xAAu8; 64];
        let bad_request =
            RpcPdu::Request { call_id: 2, context_id: 0, opnum: 0, first_frag: true, last_frag: true, body: garbage }.encode();

        let actions = conn.on_bytes(&bad_request, &identity, &persistence, &env, t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ConnectionAction::Close { .. }), "expected Close with no reply, got {actions:?}");
    }

    #[test]
    fn idle_timeout_closes_connection() {
        let env = TestEnv;
        let t0 = env.now();
        let mut conn: Connection<Instant> = Connection::new(t0, ConnectionConfig { idle_timeout: Duration::from_secs(5), ..ConnectionConfig::default() });

        let t1 = t0 + Duration::from_secs(10);
        let actions = conn.tick(t1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ConnectionAction::Close { .. }));
    }
}
