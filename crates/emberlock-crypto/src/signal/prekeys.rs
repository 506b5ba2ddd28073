//! Pre-key generation and bundle creation.
//!
//! A party publishes a [`PreKeyBundle`] so others can start a session with
//! it while it is offline. The signed pre-key carries an XEdDSA signature by
//! the identity key; one-time pre-keys are handed out at most once by the
//! pre-key store.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keys::{IdentityKeyPair, KeyPair, KEY_LEN};
use crate::xeddsa;

/// Medium-term pre-key signed by the owning identity.
#[derive(Clone, Debug)]
pub struct SignedPreKey {
    key_pair: KeyPair,
    signature: Vec<u8>,
    key_id: u32,
}

impl SignedPreKey {
    /// Generate a new pre-key and sign its public half with `identity`.
    pub fn generate(identity: &IdentityKeyPair, key_id: u32) -> Result<Self> {
        let key_pair = KeyPair::generate()?;
        let signature = identity.sign(key_pair.public_key())?.to_vec();
        Ok(Self {
            key_pair,
            signature,
            key_id,
        })
    }

    /// Reassemble a stored pre-key. The signature is checked against
    /// `identity_key` so a corrupted record can never be published.
    pub fn from_parts(
        key_pair: KeyPair,
        signature: Vec<u8>,
        key_id: u32,
        identity_key: &[u8; KEY_LEN],
    ) -> Result<Self> {
        xeddsa::verify(identity_key, key_pair.public_key(), &signature)?;
        Ok(Self {
            key_pair,
            signature,
            key_id,
        })
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }
}

/// Single-use pre-key.
#[derive(Clone, Debug)]
pub struct OneTimePreKey {
    key_pair: KeyPair,
    key_id: u32,
}

impl OneTimePreKey {
    pub fn generate(key_id: u32) -> Result<Self> {
        Ok(Self {
            key_pair: KeyPair::generate()?,
            key_id,
        })
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }
}

/// The public key material needed to start a session with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// X25519 identity public key.
    pub identity_key: [u8; KEY_LEN],
    /// X25519 signed prekey (public).
    pub signed_prekey: [u8; KEY_LEN],
    pub signed_prekey_id: u32,
    /// XEdDSA signature over the signed prekey by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    /// Optional one-time prekey (consumed on first use).
    pub one_time_prekey: Option<[u8; KEY_LEN]>,
    pub one_time_prekey_id: Option<u32>,
}

impl PreKeyBundle {
    /// Assemble the public bundle for an identity.
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
    ) -> Self {
        Self {
            identity_key: *identity.public_key(),
            signed_prekey: *signed_prekey.key_pair().public_key(),
            signed_prekey_id: signed_prekey.key_id(),
            signed_prekey_signature: signed_prekey.signature().to_vec(),
            one_time_prekey: one_time_prekey.map(|otpk| *otpk.key_pair().public_key()),
            one_time_prekey_id: one_time_prekey.map(OneTimePreKey::key_id),
        }
    }

    pub fn has_one_time_prekey(&self) -> bool {
        self.one_time_prekey.is_some()
    }

    /// A bundle without a one-time pre-key is valid but gives no protection
    /// against replay of the initial message.
    pub fn is_low_assurance(&self) -> bool {
        !self.has_one_time_prekey()
    }
}
