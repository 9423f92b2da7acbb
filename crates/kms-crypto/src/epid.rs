//! EPID (Extended PID) and HWID generation.

use kms_proto::Guid;

/// One row of the small catalog mapping an `applicationId` to the platform
/// and OEM/SKU codes embedded in the EPID string.
struct PlatformEntry {
    application_id: Guid,
    platform_id: &'static str,
    oem_sku: &'static str,
}

/// A handful of well-known `applicationId`s. Anything not in this table
/// falls back to a generic platform/OEM code rather than failing — the
/// exact digits are cosmetic to the client.
const CATALOG: &[PlatformEntry] = &[
    PlatformEntry {
        application_id: Guid { data1: 0x55c9_2734, data2: 0xd682, data3: 0x4d71, data4: [0x98, 0x3e, 0xd6, 0xec, 0x3f, 0x16, 0x05, 0x9f] },
        platform_id: "05426",
        oem_sku: "000000",
    },
    PlatformEntry {
        application_id: Guid { data1: 0x2b88_760d, data2: 0xd082, data3: 0x46d4, data4: [0x8f, 0x4d, 0x30, 0xa5, 0xa2, 0x40, 0x2c, 0x23] },
        platform_id: "06401",
        oem_sku: "000400",
    },
    PlatformEntry {
        application_id: Guid { data1: 0x7311_1121, data2: 0x5638, data3: 0x40f6, data4: [0xbc, 0x11, 0xf1, 0xd7, 0xb0, 0xd6, 0x43, 0x00] },
        platform_id: "06401",
        oem_sku: "000300",
    },
];

const DEFAULT_PLATFORM_ID: &str = "06401";
const DEFAULT_OEM_SKU: &str = "000000";
const GROUP_ID: &str = "00206";

fn catalog_entry(application_id: &Guid) -> (&'static str, &'static str) {
    CATALOG
        .iter()
        .find(|e| &e.application_id == application_id)
        .map_or((DEFAULT_PLATFORM_ID, DEFAULT_OEM_SKU), |e| (e.platform_id, e.oem_sku))
}

/// Generate an EPID string for `application_id`, given a license count,
/// language ID, and the four-digit year to stamp.
///
/// `license_count` is clamped to the 0-999 range the `CCC` field allows.
#[must_use]
pub fn generate_epid(application_id: &Guid, license_count: u16, language_id: u16, year: u16) -> String {
    let (platform_id, oem_sku) = catalog_entry(application_id);
    let license_count = license_count.min(999);
    let lang_high = (language_id >> 8) as u8;

    format!(
        "{platform_id}-{GROUP_ID}-{license_count:03}-{oem_sku}-{lang_high:02}-{year:04}",
    )
}

/// Render an 8-byte HWID as the hex string some deployments want for config
/// echoing; not part of the wire format (the wire format carries the raw
/// bytes).
#[must_use]
pub fn hwid_to_hex(hwid: &[u8; 8]) -> String {
    hwid.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse an operator-supplied hex string (16 hex chars, case-insensitive,
/// optional separators) into an 8-byte HWID.
#[must_use]
pub fn hwid_from_hex(s: &str) -> Option<[u8; 8]> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace() && *c != '-' && *c != ':').collect();
    if cleaned.len() != 16 {
        return None;
    }
    let mut out = [0u8; 8];
    for i in 0..8 {
        out[i] = u8::from_str_radix(&cleaned[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-rolled check for `[0-9]{5}-[0-9]{5}-[0-9]{3}-[0-9]{6}-[0-9]{2}-[0-9]{4}`
    /// so this crate doesn't need a regex dependency just for one test.
    fn matches_epid_shape(s: &str) -> bool {
        let groups: Vec<&str> = s.split('-').collect();
        let widths = [5, 5, 3, 6, 2, 4];
        groups.len() == widths.len()
            && groups.iter().zip(widths).all(|(g, w)| g.len() == w && g.bytes().all(|b| b.is_ascii_digit()))
    }

    #[test]
    fn epid_matches_expected_shape() {
        let app_id = Guid { data1: 0x55c9_2734, data2: 0xd682, data3: 0x4d71, data4: [0x98, 0x3e, 0xd6, 0xec, 0x3f, 0x16, 0x05, 0x9f] };
        let epid = generate_epid(&app_id, 100, 0x0409, 2026);
        assert!(matches_epid_shape(&epid), "epid {epid} did not match expected shape");
    }

    #[test]
    fn unknown_application_id_falls_back_to_default() {
        let app_id = Guid::NIL;
        let epid = generate_epid(&app_id, 50, 0x0409, 2026);
        assert!(epid.starts_with(DEFAULT_PLATFORM_ID));
    }

    #[test]
    fn license_count_is_clamped() {
        let app_id = Guid::NIL;
        let epid = generate_epid(&app_id, 5000, 0x0409, 2026);
        assert!(epid.contains("-999-"));
    }

    #[test]
    fn hwid_hex_round_trips() {
        let hwid = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33];
        let hex = hwid_to_hex(&hwid);
        assert_eq!(hwid_from_hex(&hex).unwrap(), hwid);
    }

    #[test]
    fn hwid_from_hex_rejects_wrong_length() {
        assert_eq!(hwid_from_hex("deadbeef"), None);
    }
}
