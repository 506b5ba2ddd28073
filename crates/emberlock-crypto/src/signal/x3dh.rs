//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! Initiator (Alice) with identity `IK_A` and ephemeral `EK_A`, responder
//! (Bob) publishing `IK_B`, `SPK_B` and optionally `OPK_B`:
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)          (only with a one-time prekey)
//! SK  = HKDF(salt = 0^32, DH1 || DH2 || DH3 [|| DH4], "Emberlock_X3DH")
//! ```
//!
//! The signed pre-key signature is checked before any DH is computed.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::keys::{fingerprint, is_zero, IdentityKeyPair, KeyPair, KEY_LEN};
use crate::primitives::hkdf_derive;
use crate::signal::prekeys::{OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::xeddsa;

/// HKDF info label for the X3DH shared secret.
pub const X3DH_INFO: &[u8] = b"Emberlock_X3DH";

/// What the initiator sends alongside its first ciphertext so the responder
/// can mirror the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator's identity public key.
    pub identity_key: [u8; KEY_LEN],
    /// Initiator's ephemeral public key.
    pub ephemeral_key: [u8; KEY_LEN],
    /// The responder identity key the initiator agreed against.
    pub recipient_identity_key: [u8; KEY_LEN],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    /// Initiator's first ratchet public key.
    pub ratchet_key: [u8; KEY_LEN],
}

/// Check the identity key's signature over the signed pre-key.
///
/// An empty or all-zero signature is [`CryptoError::MissingSignature`]; any
/// other failure is [`CryptoError::InvalidSignature`].
pub fn verify_signed_prekey_signature(
    identity_key: &[u8; KEY_LEN],
    signed_prekey: &[u8; KEY_LEN],
    signature: &[u8],
) -> Result<()> {
    if signature.is_empty() || is_zero(signature) {
        return Err(CryptoError::MissingSignature);
    }
    xeddsa::verify(identity_key, signed_prekey, signature)
}

/// Initiator side: derive the shared secret from a remote bundle.
pub fn x3dh_initiate(
    identity: &IdentityKeyPair,
    ephemeral: &KeyPair,
    bundle: &PreKeyBundle,
) -> Result<[u8; KEY_LEN]> {
    if let Err(e) = verify_signed_prekey_signature(
        &bundle.identity_key,
        &bundle.signed_prekey,
        &bundle.signed_prekey_signature,
    ) {
        tracing::warn!(
            identity = %fingerprint(&bundle.identity_key),
            signed_prekey_id = bundle.signed_prekey_id,
            error = %e,
            "rejecting prekey bundle"
        );
        return Err(e);
    }

    let dh1 = Zeroizing::new(identity.key_pair().diffie_hellman(&bundle.signed_prekey)?);
    let dh2 = Zeroizing::new(ephemeral.diffie_hellman(&bundle.identity_key)?);
    let dh3 = Zeroizing::new(ephemeral.diffie_hellman(&bundle.signed_prekey)?);

    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * KEY_LEN));
    ikm.extend_from_slice(dh1.as_slice());
    ikm.extend_from_slice(dh2.as_slice());
    ikm.extend_from_slice(dh3.as_slice());

    if let Some(ref otpk) = bundle.one_time_prekey {
        let dh4 = Zeroizing::new(ephemeral.diffie_hellman(otpk)?);
        ikm.extend_from_slice(dh4.as_slice());
    }

    derive_shared_secret(&ikm)
}

/// Responder side: mirror of [`x3dh_initiate`].
///
/// `one_time_prekey` must be the key named by `initial.one_time_prekey_id`,
/// already removed from the pre-key store by the caller.
pub fn x3dh_respond(
    identity: &IdentityKeyPair,
    signed_prekey: &SignedPreKey,
    one_time_prekey: Option<&OneTimePreKey>,
    initial: &InitialMessage,
) -> Result<[u8; KEY_LEN]> {
    if initial.signed_prekey_id != signed_prekey.key_id() {
        return Err(CryptoError::PreKeyError(format!(
            "initial message names signed prekey {}, have {}",
            initial.signed_prekey_id,
            signed_prekey.key_id()
        )));
    }

    let spk = signed_prekey.key_pair();
    let dh1 = Zeroizing::new(spk.diffie_hellman(&initial.identity_key)?);
    let dh2 = Zeroizing::new(identity.key_pair().diffie_hellman(&initial.ephemeral_key)?);
    let dh3 = Zeroizing::new(spk.diffie_hellman(&initial.ephemeral_key)?);

    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * KEY_LEN));
    ikm.extend_from_slice(dh1.as_slice());
    ikm.extend_from_slice(dh2.as_slice());
    ikm.extend_from_slice(dh3.as_slice());

    match (initial.one_time_prekey_id, one_time_prekey) {
        (Some(id), Some(otpk)) if id == otpk.key_id() => {
            let dh4 = Zeroizing::new(otpk.key_pair().diffie_hellman(&initial.ephemeral_key)?);
            ikm.extend_from_slice(dh4.as_slice());
        }
        (None, None) => {}
        (Some(id), _) => {
            return Err(CryptoError::PreKeyError(format!(
                "one-time prekey {id} not supplied"
            )));
        }
        (None, Some(otpk)) => {
            return Err(CryptoError::PreKeyError(format!(
                "unexpected one-time prekey {}",
                otpk.key_id()
            )));
        }
    }

    derive_shared_secret(&ikm)
}

fn derive_shared_secret(ikm: &[u8]) -> Result<[u8; KEY_LEN]> {
    hkdf_derive::<KEY_LEN>(ikm, Some(&[0u8; KEY_LEN]), X3DH_INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bob {
        identity: IdentityKeyPair,
        spk: SignedPreKey,
        otpk: OneTimePreKey,
    }

    fn bob() -> Bob {
        let identity = IdentityKeyPair::generate().unwrap();
        let spk = SignedPreKey::generate(&identity, 1).unwrap();
        let otpk = OneTimePreKey::generate(100).unwrap();
        Bob {
            identity,
            spk,
            otpk,
        }
    }

    fn initial_for(
        alice: &IdentityKeyPair,
        ephemeral: &KeyPair,
        bundle: &PreKeyBundle,
    ) -> InitialMessage {
        InitialMessage {
            identity_key: *alice.public_key(),
            ephemeral_key: *ephemeral.public_key(),
            recipient_identity_key: bundle.identity_key,
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: bundle.one_time_prekey_id,
            ratchet_key: *KeyPair::generate().unwrap().public_key(),
        }
    }

    #[test]
    fn shared_secrets_match_with_one_time_prekey() {
        let bob = bob();
        let bundle = PreKeyBundle::new(&bob.identity, &bob.spk, Some(&bob.otpk));
        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();

        let sk_a = x3dh_initiate(&alice, &ephemeral, &bundle).unwrap();
        let initial = initial_for(&alice, &ephemeral, &bundle);
        let sk_b = x3dh_respond(&bob.identity, &bob.spk, Some(&bob.otpk), &initial).unwrap();
        assert_eq!(sk_a, sk_b);
    }

    #[test]
    fn shared_secrets_match_without_one_time_prekey() {
        let bob = bob();
        let bundle = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();

        let sk_a = x3dh_initiate(&alice, &ephemeral, &bundle).unwrap();
        let initial = initial_for(&alice, &ephemeral, &bundle);
        let sk_b = x3dh_respond(&bob.identity, &bob.spk, None, &initial).unwrap();
        assert_eq!(sk_a, sk_b);
    }

    #[test]
    fn one_time_prekey_changes_the_secret() {
        let bob = bob();
        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();

        let with = PreKeyBundle::new(&bob.identity, &bob.spk, Some(&bob.otpk));
        let without = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        assert_ne!(
            x3dh_initiate(&alice, &ephemeral, &with).unwrap(),
            x3dh_initiate(&alice, &ephemeral, &without).unwrap()
        );
    }

    #[test]
    fn empty_signature_is_missing() {
        let bob = bob();
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        bundle.signed_prekey_signature.clear();

        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();
        assert!(matches!(
            x3dh_initiate(&alice, &ephemeral, &bundle),
            Err(CryptoError::MissingSignature)
        ));
    }

    #[test]
    fn zero_signature_is_rejected() {
        let bob = bob();
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        bundle.signed_prekey_signature = vec![0u8; 64];

        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();
        let err = x3dh_initiate(&alice, &ephemeral, &bundle).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn substituted_signed_prekey_is_rejected() {
        let bob = bob();
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        bundle.signed_prekey = *KeyPair::generate().unwrap().public_key();

        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();
        assert!(matches!(
            x3dh_initiate(&alice, &ephemeral, &bundle),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn substituted_identity_key_is_rejected() {
        let bob = bob();
        let mallory = IdentityKeyPair::generate().unwrap();
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        bundle.identity_key = *mallory.public_key();

        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();
        assert!(matches!(
            x3dh_initiate(&alice, &ephemeral, &bundle),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn responder_requires_named_one_time_prekey() {
        let bob = bob();
        let bundle = PreKeyBundle::new(&bob.identity, &bob.spk, Some(&bob.otpk));
        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();
        let initial = initial_for(&alice, &ephemeral, &bundle);

        assert!(matches!(
            x3dh_respond(&bob.identity, &bob.spk, None, &initial),
            Err(CryptoError::PreKeyError(_))
        ));

        let wrong = OneTimePreKey::generate(101).unwrap();
        assert!(x3dh_respond(&bob.identity, &bob.spk, Some(&wrong), &initial).is_err());
    }

    #[test]
    fn responder_rejects_wrong_signed_prekey_id() {
        let bob = bob();
        let bundle = PreKeyBundle::new(&bob.identity, &bob.spk, None);
        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = KeyPair::generate().unwrap();
        let mut initial = initial_for(&alice, &ephemeral, &bundle);
        initial.signed_prekey_id = 2;

        assert!(x3dh_respond(&bob.identity, &bob.spk, None, &initial).is_err());
    }
}
