use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::xeddsa::{self, SIGNATURE_LENGTH};

/// Length of every key field in the protocol.
pub const KEY_LEN: usize = 32;

/// An X25519 key pair.
///
/// The private scalar is clamped on construction so `public` is always
/// `X25519(private, 9)`. Both halves are wiped when the pair is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private: [u8; KEY_LEN],
    public: [u8; KEY_LEN],
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG.
    ///
    /// Fails only if the system RNG fails.
    pub fn generate() -> Result<Self> {
        let mut private = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut private)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let pair = Self::from_private_bytes(private);
        private.zeroize();
        Ok(pair)
    }

    /// Rebuild a key pair from stored private key bytes.
    pub fn from_private_bytes(mut private: [u8; KEY_LEN]) -> Self {
        clamp(&mut private);
        let public = PublicKey::from(&StaticSecret::from(private)).to_bytes();
        Self { private, public }
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// Raw private scalar.
    ///
    /// # Security
    /// Raw private key bytes. Never log or persist unencrypted.
    pub fn private_key(&self) -> &[u8; KEY_LEN] {
        &self.private
    }

    /// X25519 agreement with a peer public key.
    pub fn diffie_hellman(&self, peer_public: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN]> {
        shared_secret(&self.private, peer_public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Long-lived identity key. Signs pre-keys with XEdDSA so the same X25519
/// key serves both agreement and authentication.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair(KeyPair);

impl IdentityKeyPair {
    pub fn generate() -> Result<Self> {
        KeyPair::generate().map(Self)
    }

    pub fn from_key_pair(key_pair: KeyPair) -> Self {
        Self(key_pair)
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.0
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        self.0.public_key()
    }

    /// XEdDSA signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LENGTH]> {
        let mut random = [0u8; 64];
        OsRng
            .try_fill_bytes(&mut random)
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;
        let signature = xeddsa::sign(self.0.private_key(), message, &random);
        random.zeroize();
        Ok(signature)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityKeyPair")
            .field(&hex::encode(self.0.public))
            .finish()
    }
}

/// Generate a fresh X25519 key pair.
pub fn generate_key_pair() -> Result<KeyPair> {
    KeyPair::generate()
}

/// X25519 scalar multiplication.
///
/// An all-zero peer key or a low-order point yields a non-contributory
/// output; both are rejected so no small-subgroup value reaches a KDF.
pub fn shared_secret(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN]> {
    if is_zero(public_key) {
        return Err(CryptoError::InvalidKey("all-zero public key".into()));
    }
    let secret = StaticSecret::from(*private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(*public_key));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order public key".into()));
    }
    Ok(shared.to_bytes())
}

/// Check that a rotation actually produced a usable new key.
pub fn verify_identity_key_rotation(old_key: &[u8; KEY_LEN], new_key: &[u8; KEY_LEN]) -> Result<()> {
    if old_key == new_key {
        return Err(CryptoError::RotationError("keys are identical".into()));
    }
    if is_zero(new_key) {
        return Err(CryptoError::RotationError("new key is invalid".into()));
    }
    Ok(())
}

/// Short hex prefix of a public key, for log fields.
pub fn fingerprint(public_key: &[u8; KEY_LEN]) -> String {
    hex::encode(&public_key[..8])
}

pub(crate) fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

fn clamp(scalar: &mut [u8; KEY_LEN]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_private_key_is_clamped() {
        for _ in 0..16 {
            let pair = generate_key_pair().unwrap();
            let private = pair.private_key();
            assert_eq!(private[0] & 7, 0);
            assert_eq!(private[31] & 0x80, 0);
            assert_eq!(private[31] & 0x40, 0x40);
        }
    }

    #[test]
    fn public_key_matches_scalar_base_mult() {
        let pair = generate_key_pair().unwrap();
        let expected = x25519_dalek::x25519(*pair.private_key(), x25519_dalek::X25519_BASEPOINT_BYTES);
        assert_eq!(pair.public_key(), &expected);
    }

    #[test]
    fn restore_from_private_bytes() {
        let pair = generate_key_pair().unwrap();
        let restored = KeyPair::from_private_bytes(*pair.private_key());
        assert_eq!(pair.public_key(), restored.public_key());
    }

    #[test]
    fn dh_agreement_is_symmetric() {
        let alice = generate_key_pair().unwrap();
        let bob = generate_key_pair().unwrap();

        let shared_a = alice.diffie_hellman(bob.public_key()).unwrap();
        let shared_b = bob.diffie_hellman(alice.public_key()).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn zero_public_key_rejected() {
        let alice = generate_key_pair().unwrap();
        assert!(matches!(
            alice.diffie_hellman(&[0u8; KEY_LEN]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn low_order_public_key_rejected() {
        // u = 1 is a small-order point; a clamped scalar sends it to zero.
        let mut low_order = [0u8; KEY_LEN];
        low_order[0] = 1;
        let alice = generate_key_pair().unwrap();
        assert!(shared_secret(alice.private_key(), &low_order).is_err());
    }

    #[test]
    fn identity_signature_verifies() {
        let identity = IdentityKeyPair::generate().unwrap();
        let signature = identity.sign(b"prekey").unwrap();
        assert!(xeddsa::verify(identity.public_key(), b"prekey", &signature).is_ok());
    }

    #[test]
    fn rotation_check_rejects_identical_and_zero_keys() {
        let key = *generate_key_pair().unwrap().public_key();
        assert!(verify_identity_key_rotation(&key, &key).is_err());
        assert!(verify_identity_key_rotation(&key, &[0u8; KEY_LEN]).is_err());
        let other = *generate_key_pair().unwrap().public_key();
        assert!(verify_identity_key_rotation(&key, &other).is_ok());
    }

    #[test]
    fn debug_output_hides_private_key() {
        let pair = generate_key_pair().unwrap();
        let rendered = format!("{pair:?}");
        assert!(rendered.contains(&hex::encode(pair.public_key())));
        assert!(!rendered.contains(&hex::encode(pair.private_key())));
    }
}
