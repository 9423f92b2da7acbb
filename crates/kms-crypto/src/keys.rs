//! Compiled-in AES-128 key material, one key per protocol version.
//!
//! These are public protocol constants, not secrets — every Windows and
//! Office client ships the same bytes. They are not zeroized; the values
//! derived *from* them (the V6 HMAC key) are.

/// Key for V4's cleartext + ECB-chain authentication hash.
pub const V4_KEY: [u8; 16] = [
    0x1f, 0xcf, 0x26, 0x5d, 0x78, 0x3e, 0x41, 0x94, 0xa2, 0x0c, 0x55, 0xb8, 0x0e, 0x7b, 0x93, 0x4a,
];

/// Key for V5's CBC wrapping.
pub const V5_KEY: [u8; 16] = [
    0x5c, 0x3b, 0x8d, 0x21, 0xf0, 0x9a, 0x47, 0x6e, 0xb1, 0x8f, 0x22, 0xd4, 0x60, 0x1c, 0xae, 0x77,
];

/// Key for V6's CBC wrapping and HMAC key derivation.
pub const V6_KEY: [u8; 16] = [
    0x9e, 0x44, 0x0c, 0xb7, 0x2a, 0x85, 0x4f, 0x13, 0xd6, 0x0b, 0x7e, 0x91, 0x3c, 0x58, 0xa0, 0x2f,
];
