//! XEdDSA signatures over X25519 keys.
//!
//! Implements signing from "The XEdDSA and VXEdDSA Signature Schemes"
//! (Trevor Perrin, revision 1). The X25519 private scalar is mapped onto an
//! Edwards key whose public point always has sign bit 0, which lets anyone
//! holding only the X25519 public key check the signature. A valid XEdDSA
//! signature is an ordinary Ed25519 signature under that Edwards key, so
//! verification goes through `ed25519-dalek`.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

/// XEdDSA signature: 64 bytes (R point + s scalar).
pub const SIGNATURE_LENGTH: usize = 64;

/// Sign `message` with an X25519 private key.
///
/// `random` must be 64 fresh random bytes; it feeds the nonce derivation.
pub fn sign(x25519_private: &[u8; 32], message: &[u8], random: &[u8; 64]) -> [u8; SIGNATURE_LENGTH] {
    let mut k = *x25519_private;
    k[0] &= 248;
    k[31] &= 127;
    k[31] |= 64;
    let k_scalar = Scalar::from_bytes_mod_order(k);
    k.zeroize();

    // E = kB; flip the scalar if needed so the public point has sign bit 0.
    let e_compressed = EdwardsPoint::mul_base(&k_scalar).compress();
    let negate = (e_compressed.as_bytes()[31] >> 7) == 1;
    let mut a = if negate { -k_scalar } else { k_scalar };
    let mut public = *e_compressed.as_bytes();
    public[31] &= 0x7F;

    // r = hash1(a || M || Z) (mod q)
    let mut hasher = Sha512::new();
    hasher.update([0xFE]);
    hasher.update([0xFF; 31]);
    hasher.update(a.as_bytes());
    hasher.update(message);
    hasher.update(random);
    let mut r = wide_scalar(hasher);

    let r_compressed = EdwardsPoint::mul_base(&r).compress();

    // h = hash(R || A || M) (mod q)
    let mut hasher = Sha512::new();
    hasher.update(r_compressed.as_bytes());
    hasher.update(public);
    hasher.update(message);
    let h = wide_scalar(hasher);

    let s = r + h * a;
    a.zeroize();
    r.zeroize();

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(r_compressed.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

/// Verify an XEdDSA signature against an X25519 public key.
///
/// Any malformed input (wrong length, undecodable point, non-canonical
/// scalar) is reported as [`CryptoError::InvalidSignature`].
pub fn verify(x25519_public: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let signature: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;

    let edwards_public = edwards_public_key(x25519_public)?;
    let verifying_key =
        VerifyingKey::from_bytes(&edwards_public).map_err(|_| CryptoError::InvalidSignature)?;

    verifying_key
        .verify_strict(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Birational map from a Montgomery u-coordinate to the Edwards point with
/// sign bit 0.
fn edwards_public_key(u_bytes: &[u8; 32]) -> Result<[u8; 32]> {
    let mut u_masked = *u_bytes;
    u_masked[31] &= 0x7F;

    let edwards = MontgomeryPoint(u_masked)
        .to_edwards(0)
        .ok_or(CryptoError::InvalidSignature)?;
    Ok(edwards.compress().to_bytes())
}

fn wide_scalar(hasher: Sha512) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}
