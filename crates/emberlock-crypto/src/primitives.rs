//! Stateless HKDF and AEAD helpers shared by X3DH and the ratchet.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{CryptoError, Result};

/// AES-GCM nonce length (96 bits).
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// AES-256 key length.
pub const AEAD_KEY_LEN: usize = 32;

/// HKDF-SHA256 extract-and-expand into a freshly allocated buffer.
///
/// `salt = None` is the RFC 5869 default (a zero-filled block).
pub fn hkdf_derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Fixed-size variant of [`hkdf_derive_key`].
pub fn hkdf_derive<const N: usize>(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; N]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Encrypt with AES-256-GCM under a random nonce.
///
/// Returns `[12-byte nonce || ciphertext || 16-byte tag]`.
pub fn encrypt_aead(key: &[u8], plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AEAD_KEY_LEN {
        return Err(CryptoError::InvalidKey("key must be 32 bytes for AES-256".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt output of [`encrypt_aead`].
///
/// Fails closed: any problem (short input, wrong key, tampered bytes,
/// mismatched associated data) is the same [`CryptoError::DecryptionFailed`]
/// and no partial plaintext is ever returned.
pub fn decrypt_aead(key: &[u8], data: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// AES-256-GCM without associated data.
pub fn encrypt_aes_gcm(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    encrypt_aead(key, plaintext, &[])
}

/// Inverse of [`encrypt_aes_gcm`].
pub fn decrypt_aes_gcm(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    decrypt_aead(key, ciphertext, &[])
}
