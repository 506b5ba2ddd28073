use crate::error::CryptoError;
use crate::keys::IdentityKeyPair;
use crate::signal::prekeys::{OneTimePreKey, PreKeyBundle, SignedPreKey};

/// Storage for users' own identity key pairs.
///
/// A store keeps the current key plus any older keys that have not been
/// invalidated yet, so sessions addressed to a just-rotated key can still be
/// accepted during the transition window.
pub trait IdentityKeyStore: Send + Sync {
    /// Current identity key for `user_id`, or `None` for a user without one.
    fn get_identity_key(&self, user_id: &str) -> Result<Option<IdentityKeyPair>, CryptoError>;

    /// Store `key_pair` as the new current identity for `user_id`.
    fn store_identity_key(&self, user_id: &str, key_pair: &IdentityKeyPair) -> Result<(), CryptoError>;

    /// Drop superseded keys. With `keep_current = false` the current key is
    /// dropped as well (compromise response).
    fn invalidate_old_keys(&self, user_id: &str, keep_current: bool) -> Result<(), CryptoError>;
}

/// Hook into whatever decides that an identity key can no longer be trusted.
pub trait CompromiseDetector: Send + Sync {
    fn is_key_compromised(&self, user_id: &str, key_pair: &IdentityKeyPair) -> Result<bool, CryptoError>;

    /// Record that `key_pair` was found compromised and is being replaced.
    fn report_compromise(&self, user_id: &str, key_pair: &IdentityKeyPair) -> Result<(), CryptoError>;
}

/// Storage for a user's published pre-keys.
///
/// One-time prekeys are consumed after first use.
pub trait PreKeyStore: Send + Sync {
    /// Bundle to hand to the next peer that wants to start a session.
    /// Includes a one-time prekey while any remain.
    fn next_bundle(&self) -> Result<PreKeyBundle, CryptoError>;

    /// Remove and return a one-time prekey. A second call with the same ID
    /// fails with [`CryptoError::OneTimePreKeyConsumed`].
    fn take_one_time_prekey(&self, prekey_id: u32) -> Result<OneTimePreKey, CryptoError>;

    /// Look up a signed prekey by ID.
    fn signed_prekey(&self, signed_prekey_id: u32) -> Result<SignedPreKey, CryptoError>;
}
