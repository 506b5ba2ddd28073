use std::time::{Duration, SystemTime};

use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::keys::{fingerprint, verify_identity_key_rotation, IdentityKeyPair, KeyPair, KEY_LEN};
use crate::signal::prekeys::{OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::signal::ratchet::{initialize_double_ratchet, DoubleRatchetState, Role};
use crate::signal::x3dh::{x3dh_initiate, x3dh_respond, InitialMessage};

/// How long a peer's superseded identity key is still accepted.
pub const DEFAULT_TRANSITION_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Per-session knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Grace period after a peer rotates its identity during which bundles
    /// signed by the old identity are still accepted.
    pub transition_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transition_window: DEFAULT_TRANSITION_WINDOW,
        }
    }
}

/// One end of a 1:1 encrypted conversation.
///
/// Single-writer: every operation that touches the ratchet takes `&mut self`,
/// so callers serialize access per conversation (one lock or one task).
pub struct SignalSession {
    state: Option<DoubleRatchetState>,
    identity: IdentityKeyPair,
    /// Our identity before the last rotation; still accepted as a recipient.
    previous_identity: Option<IdentityKeyPair>,
    local_id: String,
    remote_id: String,
    is_initiator: bool,
    key_rotation_time: SystemTime,
    /// Peer identity pinned on first use.
    peer_identity: Option<[u8; KEY_LEN]>,
    /// Peer identity superseded by a rotation, and when we learned of it.
    peer_previous_identity: Option<([u8; KEY_LEN], SystemTime)>,
    config: SessionConfig,
}

impl SignalSession {
    pub fn new(identity: IdentityKeyPair, local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self::with_rotation(identity, None, local_id, remote_id)
    }

    /// Session for an identity that was recently rotated; sessions
    /// addressed to `previous_identity` can still be accepted.
    pub fn with_rotation(
        identity: IdentityKeyPair,
        previous_identity: Option<IdentityKeyPair>,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Self {
        Self {
            state: None,
            identity,
            previous_identity,
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            is_initiator: false,
            key_rotation_time: SystemTime::now(),
            peer_identity: None,
            peer_previous_identity: None,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a session with the owner of `bundle` (initiator side of X3DH).
    ///
    /// The returned [`InitialMessage`] must reach the peer together with the
    /// first ciphertext. Bundles signed by an identity inside the rotation
    /// transition window are routed through
    /// [`handle_rotated_identity_key`](Self::handle_rotated_identity_key).
    pub fn establish_session(&mut self, bundle: &PreKeyBundle) -> Result<InitialMessage> {
        if self.is_rotation_transition(&bundle.identity_key) {
            return self.establish_with_rotation(bundle);
        }
        self.check_peer_identity(&bundle.identity_key)?;
        let initial = self.initiate(bundle)?;
        if self.peer_identity.is_none() {
            self.peer_identity = Some(bundle.identity_key);
        }
        Ok(initial)
    }

    /// Establish against a bundle that may carry a rotated-away identity.
    ///
    /// If the bundle's identity is our previous identity, or the peer's
    /// previous identity while the transition window is open, the session is
    /// established with our current identity instead of failing. Anything
    /// else takes the normal path.
    pub fn handle_rotated_identity_key(&mut self, bundle: &PreKeyBundle) -> Result<InitialMessage> {
        if self.is_rotation_transition(&bundle.identity_key) {
            self.establish_with_rotation(bundle)
        } else {
            self.establish_session(bundle)
        }
    }

    fn establish_with_rotation(&mut self, bundle: &PreKeyBundle) -> Result<InitialMessage> {
        tracing::info!(
            local_id = %self.local_id,
            remote_id = %self.remote_id,
            bundle_identity = %fingerprint(&bundle.identity_key),
            "establishing session across identity key rotation"
        );
        self.initiate(bundle)
    }

    fn initiate(&mut self, bundle: &PreKeyBundle) -> Result<InitialMessage> {
        if bundle.is_low_assurance() {
            tracing::warn!(
                remote_id = %self.remote_id,
                "prekey bundle has no one-time prekey; initial message is replayable"
            );
        }

        let ephemeral = KeyPair::generate()?;
        let shared_secret = Zeroizing::new(x3dh_initiate(&self.identity, &ephemeral, bundle)?);
        let first_ratchet = KeyPair::generate()?;

        let initial = InitialMessage {
            identity_key: *self.identity.public_key(),
            ephemeral_key: *ephemeral.public_key(),
            recipient_identity_key: bundle.identity_key,
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: bundle.one_time_prekey_id,
            ratchet_key: *first_ratchet.public_key(),
        };

        let state = initialize_double_ratchet(
            &shared_secret,
            Role::Initiator,
            first_ratchet,
            bundle.signed_prekey,
        )?;
        self.state = Some(state);
        self.is_initiator = true;

        tracing::info!(
            local_id = %self.local_id,
            remote_id = %self.remote_id,
            signed_prekey_id = bundle.signed_prekey_id,
            one_time_prekey_id = ?bundle.one_time_prekey_id,
            "session established"
        );
        Ok(initial)
    }

    /// Responder side of X3DH.
    ///
    /// `one_time_prekey` must already be taken out of the pre-key store
    /// (see [`PreKeyStore::take_one_time_prekey`](crate::signal::store::PreKeyStore::take_one_time_prekey)).
    pub fn accept_session(
        &mut self,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        initial: &InitialMessage,
    ) -> Result<()> {
        self.check_peer_identity(&initial.identity_key)?;

        let shared_secret = {
            let identity = self.recipient_identity(&initial.recipient_identity_key)?;
            Zeroizing::new(x3dh_respond(identity, signed_prekey, one_time_prekey, initial)?)
        };

        let state = initialize_double_ratchet(
            &shared_secret,
            Role::Responder,
            signed_prekey.key_pair().clone(),
            initial.ratchet_key,
        )?;
        self.state = Some(state);
        self.is_initiator = false;
        if self.peer_identity.is_none() {
            self.peer_identity = Some(initial.identity_key);
        }

        tracing::info!(
            local_id = %self.local_id,
            remote_id = %self.remote_id,
            signed_prekey_id = initial.signed_prekey_id,
            "session accepted"
        );
        Ok(())
    }

    fn recipient_identity(&self, recipient: &[u8; KEY_LEN]) -> Result<&IdentityKeyPair> {
        if self.identity.public_key() == recipient {
            return Ok(&self.identity);
        }
        match &self.previous_identity {
            Some(previous) if previous.public_key() == recipient => {
                tracing::info!(
                    local_id = %self.local_id,
                    "initial message addressed to previous identity key"
                );
                Ok(previous)
            }
            _ => {
                tracing::warn!(
                    local_id = %self.local_id,
                    recipient = %fingerprint(recipient),
                    "initial message addressed to unknown identity key"
                );
                Err(CryptoError::UnknownRecipientIdentity)
            }
        }
    }

    /// Encrypt `plaintext` for the peer.
    ///
    /// Output is `header(72) || nonce(12) || ciphertext || tag(16)`. On
    /// failure the session is unchanged and the call can be retried.
    pub fn encrypt_message(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let associated_data = associated_data(&self.local_id, &self.remote_id);
        let state = self.state.as_mut().ok_or(CryptoError::SessionNotEstablished)?;
        state.encrypt(plaintext, &associated_data)
    }

    /// Decrypt a message from the peer.
    ///
    /// Any failure to authenticate the message is reported as the generic
    /// [`CryptoError::DecryptionFailed`].
    ///
    /// A DH ratchet step that falls due on receipt is attempted right away;
    /// if that step fails it is only logged, and the next
    /// [`encrypt_message`](Self::encrypt_message) retries it and returns
    /// its error.
    pub fn decrypt_message(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let associated_data = associated_data(&self.remote_id, &self.local_id);
        let state = self.state.as_mut().ok_or(CryptoError::SessionNotEstablished)?;

        let plaintext = state.decrypt(ciphertext, &associated_data).map_err(|_| {
            tracing::warn!(remote_id = %self.remote_id, "message failed to decrypt");
            CryptoError::DecryptionFailed
        })?;

        // The plaintext is already committed; a failed step is retried by
        // the next encrypt.
        if let Err(e) = state.perform_ratchet_if_needed() {
            tracing::warn!(remote_id = %self.remote_id, error = %e, "deferred ratchet step failed");
        }
        Ok(plaintext)
    }

    /// Replace our identity key with a fresh one. The old key becomes
    /// `previous_identity` so in-flight session requests still succeed.
    pub fn rotate_identity_key(&mut self) -> Result<()> {
        let new_identity = IdentityKeyPair::generate()?;
        verify_identity_key_rotation(self.identity.public_key(), new_identity.public_key())?;

        let previous = std::mem::replace(&mut self.identity, new_identity);
        tracing::info!(
            local_id = %self.local_id,
            old = %fingerprint(previous.public_key()),
            new = %fingerprint(self.identity.public_key()),
            "identity key rotated"
        );
        self.previous_identity = Some(previous);
        self.key_rotation_time = SystemTime::now();
        Ok(())
    }

    /// Whether `rotation_interval` has passed since the last rotation.
    /// A zero interval disables rotation.
    pub fn should_rotate_identity_key(&self, rotation_interval: Duration) -> bool {
        if rotation_interval.is_zero() {
            return false;
        }
        self.key_rotation_time
            .elapsed()
            .is_ok_and(|elapsed| elapsed >= rotation_interval)
    }

    /// Record that the peer announced a new identity key.
    ///
    /// The pinned key becomes the peer's previous identity, accepted for
    /// [`SessionConfig::transition_window`] from now.
    pub fn note_peer_identity_rotation(&mut self, new_identity_key: [u8; KEY_LEN]) -> Result<()> {
        if let Some(old) = self.peer_identity {
            verify_identity_key_rotation(&old, &new_identity_key)?;
            self.peer_previous_identity = Some((old, SystemTime::now()));
        }
        self.peer_identity = Some(new_identity_key);
        tracing::info!(
            remote_id = %self.remote_id,
            new = %fingerprint(&new_identity_key),
            "peer identity key rotated"
        );
        Ok(())
    }

    fn is_rotation_transition(&self, identity_key: &[u8; KEY_LEN]) -> bool {
        let ours = self
            .previous_identity
            .as_ref()
            .is_some_and(|previous| previous.public_key() == identity_key);
        ours || self.is_peer_previous_identity(identity_key)
    }

    fn is_peer_previous_identity(&self, identity_key: &[u8; KEY_LEN]) -> bool {
        self.peer_previous_identity
            .as_ref()
            .is_some_and(|(previous, noted_at)| {
                previous == identity_key
                    && noted_at
                        .elapsed()
                        .is_ok_and(|elapsed| elapsed < self.config.transition_window)
            })
    }

    fn check_peer_identity(&self, identity_key: &[u8; KEY_LEN]) -> Result<()> {
        match self.peer_identity {
            Some(pinned) if pinned != *identity_key && !self.is_peer_previous_identity(identity_key) => {
                tracing::warn!(
                    remote_id = %self.remote_id,
                    pinned = %fingerprint(&pinned),
                    presented = %fingerprint(identity_key),
                    "peer identity key changed"
                );
                Err(CryptoError::UntrustedIdentity)
            }
            _ => Ok(()),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state.is_some()
    }

    /// Tear the session down: ratchet state and the previous identity are
    /// wiped and peer pins forgotten. The current identity pair is wiped
    /// when the session is dropped.
    pub fn destroy(&mut self) {
        self.state = None;
        self.previous_identity = None;
        self.peer_identity = None;
        self.peer_previous_identity = None;
        tracing::debug!(local_id = %self.local_id, remote_id = %self.remote_id, "session destroyed");
    }

    pub fn ratchet(&self) -> Option<&DoubleRatchetState> {
        self.state.as_ref()
    }

    pub fn identity_public_key(&self) -> &[u8; KEY_LEN] {
        self.identity.public_key()
    }

    pub fn previous_identity_public_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.previous_identity.as_ref().map(IdentityKeyPair::public_key)
    }

    pub fn peer_identity(&self) -> Option<&[u8; KEY_LEN]> {
        self.peer_identity.as_ref()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn key_rotation_time(&self) -> SystemTime {
        self.key_rotation_time
    }
}

impl std::fmt::Debug for SignalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSession")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("identity", &fingerprint(self.identity.public_key()))
            .field("is_initiator", &self.is_initiator)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// `len(sender) || sender || len(recipient) || recipient`, lengths as u64 LE.
///
/// The length prefixes keep `("ab", "c")` and `("a", "bc")` distinct.
fn associated_data(sender: &str, recipient: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(16 + sender.len() + recipient.len());
    ad.extend_from_slice(&(sender.len() as u64).to_le_bytes());
    ad.extend_from_slice(sender.as_bytes());
    ad.extend_from_slice(&(recipient.len() as u64).to_le_bytes());
    ad.extend_from_slice(recipient.as_bytes());
    ad
}
