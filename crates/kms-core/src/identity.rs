//! The server's own stable identity: the values it reports to every client
//! regardless of who's asking.

use kms_crypto::epid::{generate_epid, hwid_from_hex};
use kms_proto::Guid;

use crate::env::Environment;

/// Default reported activation count: the `currentClientCount` floor, and
/// the fallback CCC value a synthesized EPID would carry if randomization
/// ever had to be bypassed. Synthesis itself draws CCC from the configured
/// `Environment` rather than using this constant (see [`ServerIdentity::epid_for`]).
pub const DEFAULT_LICENSE_COUNT: u16 = 100;

/// Default minutes until a client should retry activation (2 hours).
pub const DEFAULT_VL_ACTIVATION_INTERVAL: u32 = 120;

/// Default minutes until a client should renew its activation (7 days).
pub const DEFAULT_VL_RENEWAL_INTERVAL: u32 = 10080;

/// Default high-water mark for reported/activation count, and the ceiling
/// `requiredClientCount` is clamped to.
pub const DEFAULT_MAX_CLIENTS: u32 = 50;

/// Server-wide configuration and identity, read-only after construction
/// (aside from `current_client_count`, which the dispatcher may bump as
/// activations accrue).
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// 8-byte hardware fingerprint reported in V6 responses.
    pub hwid: [u8; 8],
    /// Operator-supplied EPID override, if configured; otherwise EPIDs are
    /// synthesized per `applicationId`.
    pub epid_override: Option<String>,
    /// Count of clients the server claims are currently activated.
    pub current_client_count: u32,
    /// Ceiling `currentClientCount` and `requiredClientCount` are clamped
    /// to.
    pub max_clients: u32,
    /// Minutes until the client should retry.
    pub vl_activation_interval: u32,
    /// Minutes until the client should renew.
    pub vl_renewal_interval: u32,
    /// Language ID stamped into synthesized EPIDs.
    pub language_id: u16,
}

impl ServerIdentity {
    /// Build an identity with a freshly random HWID and no EPID override,
    /// using the documented protocol defaults.
    #[must_use]
    pub fn new(hwid: [u8; 8]) -> Self {
        Self {
            hwid,
            epid_override: None,
            current_client_count: DEFAULT_LICENSE_COUNT as u32,
            max_clients: DEFAULT_MAX_CLIENTS,
            vl_activation_interval: DEFAULT_VL_ACTIVATION_INTERVAL,
            vl_renewal_interval: DEFAULT_VL_RENEWAL_INTERVAL,
            language_id: 0x0409, // en-US
        }
    }

    /// Parse an operator-supplied hex HWID override, falling back to
    /// `fallback` if it doesn't parse.
    #[must_use]
    pub fn with_hwid_hex_or(hwid_hex: Option<&str>, fallback: [u8; 8]) -> [u8; 8] {
        hwid_hex.and_then(hwid_from_hex).unwrap_or(fallback)
    }

    /// Produce the EPID string for a response to `application_id`, honoring
    /// `epid_override` if configured.
    ///
    /// Without an override, the CCC (licenses-count) field is drawn fresh
    /// from `env` on every call rather than a fixed default — a real KMS
    /// host synthesizes this per activation, and a constant value here would
    /// let a client fingerprint this server across requests.
    pub fn epid_for<E: Environment>(&self, application_id: &Guid, year: u16, env: &E) -> String {
        match &self.epid_override {
            Some(epid) => epid.clone(),
            None => {
                let ccc = env.random_u16_below(1000);
                generate_epid(application_id, ccc, self.language_id, year)
            }
        }
    }
}
