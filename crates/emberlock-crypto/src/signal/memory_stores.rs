//! In-memory implementations of the collaborator traits.
//!
//! These are suitable for:
//! - Testing and development
//! - Single-process deployments that re-key on every start
//!
//! **WARNING**: Data is lost on process exit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;

use crate::error::CryptoError;
use crate::keys::IdentityKeyPair;
use crate::signal::prekeys::{OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::signal::store::{CompromiseDetector, IdentityKeyStore, PreKeyStore};

/// In-memory identity key store.
///
/// Keeps every stored key per user, newest last, until
/// [`invalidate_old_keys`](IdentityKeyStore::invalidate_old_keys) prunes them.
#[derive(Default)]
pub struct MemoryIdentityStore {
    keys: Mutex<HashMap<String, Vec<IdentityKeyPair>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys (current and superseded) held for `user_id`.
    pub fn key_count(&self, user_id: &str) -> usize {
        self.keys.lock().get(user_id).map_or(0, Vec::len)
    }
}

impl IdentityKeyStore for MemoryIdentityStore {
    fn get_identity_key(&self, user_id: &str) -> Result<Option<IdentityKeyPair>, CryptoError> {
        Ok(self
            .keys
            .lock()
            .get(user_id)
            .and_then(|history| history.last().cloned()))
    }

    fn store_identity_key(&self, user_id: &str, key_pair: &IdentityKeyPair) -> Result<(), CryptoError> {
        self.keys
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .push(key_pair.clone());
        Ok(())
    }

    fn invalidate_old_keys(&self, user_id: &str, keep_current: bool) -> Result<(), CryptoError> {
        let mut keys = self.keys.lock();
        if keep_current {
            if let Some(history) = keys.get_mut(user_id) {
                let superseded = history.len().saturating_sub(1);
                history.drain(..superseded);
            }
        } else {
            keys.remove(user_id);
        }
        Ok(())
    }
}

/// In-memory prekey store for one identity.
///
/// Each one-time prekey is put into at most one bundle and can be taken at
/// most once.
pub struct MemoryPreKeyStore {
    identity_key: [u8; 32],
    current_signed_prekey: u32,
    signed_prekeys: Mutex<HashMap<u32, SignedPreKey>>,
    one_time_prekeys: Mutex<BTreeMap<u32, OneTimePreKey>>,
    /// IDs already placed in a bundle.
    published: Mutex<BTreeSet<u32>>,
    consumed: Mutex<HashSet<u32>>,
}

impl MemoryPreKeyStore {
    pub fn new(identity: &IdentityKeyPair, signed_prekey: SignedPreKey) -> Self {
        let current_signed_prekey = signed_prekey.key_id();
        let mut signed_prekeys = HashMap::new();
        signed_prekeys.insert(current_signed_prekey, signed_prekey);
        Self {
            identity_key: *identity.public_key(),
            current_signed_prekey,
            signed_prekeys: Mutex::new(signed_prekeys),
            one_time_prekeys: Mutex::new(BTreeMap::new()),
            published: Mutex::new(BTreeSet::new()),
            consumed: Mutex::new(HashSet::new()),
        }
    }

    /// Store with a fresh signed prekey (ID 1) and `count` one-time prekeys
    /// numbered from 1.
    pub fn generate(identity: &IdentityKeyPair, count: u32) -> Result<Self, CryptoError> {
        let store = Self::new(identity, SignedPreKey::generate(identity, 1)?);
        for key_id in 1..=count {
            store.add_one_time_prekey(OneTimePreKey::generate(key_id)?);
        }
        Ok(store)
    }

    pub fn add_one_time_prekey(&self, prekey: OneTimePreKey) {
        self.one_time_prekeys.lock().insert(prekey.key_id(), prekey);
    }

    /// One-time prekeys not yet consumed.
    pub fn remaining_one_time_prekeys(&self) -> usize {
        self.one_time_prekeys.lock().len()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn next_bundle(&self) -> Result<PreKeyBundle, CryptoError> {
        let signed_prekeys = self.signed_prekeys.lock();
        let signed_prekey = signed_prekeys
            .get(&self.current_signed_prekey)
            .ok_or_else(|| CryptoError::PreKeyError("no current signed prekey".into()))?;

        let one_time_prekeys = self.one_time_prekeys.lock();
        let mut published = self.published.lock();
        let one_time = one_time_prekeys
            .values()
            .find(|prekey| !published.contains(&prekey.key_id()));
        if let Some(prekey) = one_time {
            published.insert(prekey.key_id());
        }

        Ok(PreKeyBundle {
            identity_key: self.identity_key,
            signed_prekey: *signed_prekey.key_pair().public_key(),
            signed_prekey_id: signed_prekey.key_id(),
            signed_prekey_signature: signed_prekey.signature().to_vec(),
            one_time_prekey: one_time.map(|prekey| *prekey.key_pair().public_key()),
            one_time_prekey_id: one_time.map(OneTimePreKey::key_id),
        })
    }

    fn take_one_time_prekey(&self, prekey_id: u32) -> Result<OneTimePreKey, CryptoError> {
        let mut consumed = self.consumed.lock();
        if consumed.contains(&prekey_id) {
            tracing::warn!(prekey_id, "one-time prekey reuse attempted");
            return Err(CryptoError::OneTimePreKeyConsumed(prekey_id));
        }
        let prekey = self
            .one_time_prekeys
            .lock()
            .remove(&prekey_id)
            .ok_or_else(|| CryptoError::PreKeyError(format!("unknown one-time prekey {prekey_id}")))?;
        consumed.insert(prekey_id);
        Ok(prekey)
    }

    fn signed_prekey(&self, signed_prekey_id: u32) -> Result<SignedPreKey, CryptoError> {
        self.signed_prekeys
            .lock()
            .get(&signed_prekey_id)
            .cloned()
            .ok_or_else(|| CryptoError::PreKeyError(format!("unknown signed prekey {signed_prekey_id}")))
    }
}

/// Compromise detector backed by a fixed set of known-bad public keys.
#[derive(Default)]
pub struct StaticCompromiseDetector {
    compromised: Mutex<HashSet<[u8; 32]>>,
    reports: Mutex<Vec<(String, [u8; 32])>>,
}

impl StaticCompromiseDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a public key as compromised.
    pub fn mark_compromised(&self, public_key: [u8; 32]) {
        self.compromised.lock().insert(public_key);
    }

    /// `(user_id, public_key)` pairs passed to `report_compromise` so far.
    pub fn reports(&self) -> Vec<(String, [u8; 32])> {
        self.reports.lock().clone()
    }
}

impl CompromiseDetector for StaticCompromiseDetector {
    fn is_key_compromised(&self, _user_id: &str, key_pair: &IdentityKeyPair) -> Result<bool, CryptoError> {
        Ok(self.compromised.lock().contains(key_pair.public_key()))
    }

    fn report_compromise(&self, user_id: &str, key_pair: &IdentityKeyPair) -> Result<(), CryptoError> {
        self.reports
            .lock()
            .push((user_id.to_string(), *key_pair.public_key()));
        Ok(())
    }
}
