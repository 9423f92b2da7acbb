//! AES-128 primitives in the non-standard chaining modes KMS uses.
//!
//! None of these are "AES" in the sense of a standard mode crate providing
//! them off the shelf: V4's authentication hash is an ECB-chained MAC with
//! no real encryption of the payload, and V5/V6's CBC is hand-rolled over
//! the raw block cipher because the IV handling (prepended on the wire
//! rather than negotiated out of band) doesn't match what a `cbc` crate
//! wrapper expects.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::errors::{CryptoError, Result};

const BLOCK_LEN: usize = 16;

fn encrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

fn decrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

/// PKCS#7-style pad to a 16-byte boundary: append `n` bytes of value `n`,
/// where `n` is chosen so the result is block-aligned (`n = 16` if `data`
/// was already aligned).
#[must_use]
pub fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_LEN - (data.len() % BLOCK_LEN);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

/// Reverse of [`pad`]: validate the trailing pad bytes and strip them.
pub fn unpad(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::UnalignedBuffer(data.len()));
    }
    let pad_len = *data.last().expect("checked non-empty above") as usize;
    if pad_len == 0 || pad_len > BLOCK_LEN || pad_len > data.len() {
        return Err(CryptoError::AuthFailure);
    }
    if data[data.len() - pad_len..].iter().any(|&b| b as usize != pad_len) {
        return Err(CryptoError::AuthFailure);
    }
    Ok(data[..data.len() - pad_len].to_vec())
}

/// V4's authentication hash: starting from an all-zero state, for each
/// 16-byte block `b`, `state = AES_enc(key, state XOR b)`. The final state
/// is the 16-byte hash.
#[must_use]
pub fn ecb_chain_hash(key: &[u8; 16], padded: &[u8]) -> [u8; 16] {
    let mut state = [0u8; BLOCK_LEN];
    for chunk in padded.chunks_exact(BLOCK_LEN) {
        for (s, b) in state.iter_mut().zip(chunk) {
            *s ^= b;
        }
        encrypt_block(key, &mut state);
    }
    state
}

/// Encrypt `padded` (must be block-aligned) under CBC with the given 16-byte
/// IV; returns the ciphertext, same length as `padded`.
#[must_use]
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], padded: &[u8]) -> Vec<u8> {
    let mut prev = *iv;
    let mut out = Vec::with_capacity(padded.len());
    for chunk in padded.chunks_exact(BLOCK_LEN) {
        let mut block = [0u8; BLOCK_LEN];
        for i in 0..BLOCK_LEN {
            block[i] = chunk[i] ^ prev[i];
        }
        encrypt_block(key, &mut block);
        out.extend_from_slice(&block);
        prev = block;
    }
    out
}

/// Decrypt a CBC ciphertext (must be block-aligned) under the given 16-byte
/// IV; returns the plaintext, same length as `ciphertext`.
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::UnalignedBuffer(ciphertext.len()));
    }
    let mut prev = *iv;
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks_exact(BLOCK_LEN) {
        let mut block: [u8; BLOCK_LEN] = chunk.try_into().expect("chunks_exact yields BLOCK_LEN");
        let ct = block;
        decrypt_block(key, &mut block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        out.extend_from_slice(&block);
        prev = ct;
    }
    Ok(out)
}

/// Derive the 16-byte block `derive16(salt, requestTime) = salt[..8] ||
/// requestTime (8 bytes, little-endian)` feeding the V6 HMAC key derivation.
#[must_use]
pub fn derive16(salt: &[u8; 16], request_time_ticks: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&salt[..8]);
    out[8..].copy_from_slice(&request_time_ticks.to_le_bytes());
    out
}

/// Derive the V6 HMAC key: a single-block AES-ECB encryption of
/// `derive16(salt, requestTime)` under the V6 key (no chaining).
#[must_use]
pub fn derive_v6_hmac_key(v6_key: &[u8; 16], salt: &[u8; 16], request_time_ticks: u64) -> [u8; 16] {
    let mut block = derive16(salt, request_time_ticks);
    encrypt_block(v6_key, &mut block);
    block
}

/// Compute the V6 HMAC-SHA256 tag over `data` (the wire salt followed by the
/// ciphertext, per §4.4) using the derived key. The key is zeroized after
/// use.
#[must_use]
pub fn hmac_sha256_tag(mut hmac_key: [u8; 16], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key).expect("HMAC accepts any key length");
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    hmac_key.zeroize();
    tag.into()
}
