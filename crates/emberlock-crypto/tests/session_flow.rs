//! End-to-end session tests: two parties, real key material, in-memory
//! pre-key stores.

use emberlock_crypto::signal::ratchet::{MessageHeader, RATCHET_INTERVAL};
use emberlock_crypto::signal::{
    InitialMessage, MemoryPreKeyStore, PreKeyBundle, PreKeyStore, SignalSession, SignedPreKey,
};
use emberlock_crypto::{CryptoError, IdentityKeyPair};

struct Party {
    identity: IdentityKeyPair,
    prekeys: MemoryPreKeyStore,
    session: SignalSession,
}

impl Party {
    fn new(local: &str, remote: &str, one_time_prekeys: u32) -> Self {
        let identity = IdentityKeyPair::generate().unwrap();
        let prekeys = MemoryPreKeyStore::generate(&identity, one_time_prekeys).unwrap();
        let session = SignalSession::new(identity.clone(), local, remote);
        Self {
            identity,
            prekeys,
            session,
        }
    }

    fn accept(&mut self, initial: &InitialMessage) -> Result<(), CryptoError> {
        let signed_prekey = self.prekeys.signed_prekey(initial.signed_prekey_id)?;
        let one_time = initial
            .one_time_prekey_id
            .map(|id| self.prekeys.take_one_time_prekey(id))
            .transpose()?;
        self.session
            .accept_session(&signed_prekey, one_time.as_ref(), initial)
    }
}

fn connect(alice: &mut Party, bob: &mut Party) {
    let bundle = bob.prekeys.next_bundle().unwrap();
    let initial = alice.session.establish_session(&bundle).unwrap();
    bob.accept(&initial).unwrap();
}

// ── Concrete scenario ────────────────────────────────────────────────

#[test]
fn alice_and_bob_concrete_scenario() {
    let mut alice = Party::new("alice", "bob", 0);
    let mut bob = Party::new("bob", "alice", 0);

    // Bob's bundle: identity, signed prekey 1, signature, no one-time prekey.
    let bundle = bob.prekeys.next_bundle().unwrap();
    assert_eq!(bundle.identity_key, *bob.identity.public_key());
    assert_eq!(bundle.signed_prekey_id, 1);
    assert!(bundle.one_time_prekey.is_none());

    let initial = alice.session.establish_session(&bundle).unwrap();
    bob.accept(&initial).unwrap();

    let ratchet_before = *alice.session.ratchet().unwrap().send_ratchet_public();

    let c1 = alice.session.encrypt_message(b"hello").unwrap();
    assert!(c1.len() >= 29);
    assert_eq!(bob.session.decrypt_message(&c1).unwrap(), b"hello");
    let (first_header, _) = MessageHeader::split(&c1).unwrap();

    // Messages 2..=100 stay on the chain message 1 opened.
    for i in 2..=100u32 {
        let c = alice.session.encrypt_message(&i.to_le_bytes()).unwrap();
        let (header, _) = MessageHeader::split(&c).unwrap();
        assert_eq!(header.ratchet_key, first_header.ratchet_key);
        assert_eq!(header.counter, i - 1);
        assert_eq!(bob.session.decrypt_message(&c).unwrap(), i.to_le_bytes());
    }
    // After 100 calls the sending ratchet differs from before call 1.
    assert_ne!(
        alice.session.ratchet().unwrap().send_ratchet_public(),
        &ratchet_before
    );

    // Message 101 opens a new chain under a new ratchet key.
    let c101 = alice.session.encrypt_message(b"101").unwrap();
    let (header, _) = MessageHeader::split(&c101).unwrap();
    assert_ne!(header.ratchet_key, first_header.ratchet_key);
    assert_eq!(header.counter, 0);
    assert_eq!(header.prev_chain_len, RATCHET_INTERVAL);
    assert_eq!(bob.session.decrypt_message(&c101).unwrap(), b"101");
}

#[test]
fn sending_chain_steps_every_interval() {
    let mut alice = Party::new("alice", "bob", 1);
    let mut bob = Party::new("bob", "alice", 1);
    connect(&mut alice, &mut bob);

    let mut ratchet_keys = Vec::new();
    for i in 0..(3 * RATCHET_INTERVAL) {
        let c = alice.session.encrypt_message(b"tick").unwrap();
        let (header, _) = MessageHeader::split(&c).unwrap();
        assert_eq!(header.counter, i % RATCHET_INTERVAL);
        if header.counter == 0 {
            ratchet_keys.push(header.ratchet_key);
        }
        bob.session.decrypt_message(&c).unwrap();
    }
    assert_eq!(ratchet_keys.len(), 3);
    assert_ne!(ratchet_keys[0], ratchet_keys[1]);
    assert_ne!(ratchet_keys[1], ratchet_keys[2]);
}

// ── Conversation ─────────────────────────────────────────────────────

#[test]
fn long_interleaved_conversation() {
    let mut alice = Party::new("alice", "bob", 4);
    let mut bob = Party::new("bob", "alice", 4);
    connect(&mut alice, &mut bob);

    for round in 0..5u8 {
        for i in 0..120u8 {
            let msg = [round, i];
            let c = alice.session.encrypt_message(&msg).unwrap();
            assert_eq!(bob.session.decrypt_message(&c).unwrap(), msg);
        }
        for i in 0..3u8 {
            let msg = [0xB0, round, i];
            let c = bob.session.encrypt_message(&msg).unwrap();
            assert_eq!(alice.session.decrypt_message(&c).unwrap(), msg);
        }
    }
}

#[test]
fn both_sides_send_before_hearing_back() {
    let mut alice = Party::new("alice", "bob", 1);
    let mut bob = Party::new("bob", "alice", 1);
    connect(&mut alice, &mut bob);

    let from_alice = alice.session.encrypt_message(b"a1").unwrap();
    let from_bob = bob.session.encrypt_message(b"b1").unwrap();

    assert_eq!(alice.session.decrypt_message(&from_bob).unwrap(), b"b1");
    assert_eq!(bob.session.decrypt_message(&from_alice).unwrap(), b"a1");

    let c = alice.session.encrypt_message(b"a2").unwrap();
    assert_eq!(bob.session.decrypt_message(&c).unwrap(), b"a2");
    let c = bob.session.encrypt_message(b"b2").unwrap();
    assert_eq!(alice.session.decrypt_message(&c).unwrap(), b"b2");
}

// ── Failure handling ─────────────────────────────────────────────────

#[test]
fn replay_and_tamper_fail_generically() {
    let mut alice = Party::new("alice", "bob", 1);
    let mut bob = Party::new("bob", "alice", 1);
    connect(&mut alice, &mut bob);

    let c1 = alice.session.encrypt_message(b"once").unwrap();

    let mut tampered = c1.clone();
    tampered[80] ^= 0x40;
    let tamper_err = bob.session.decrypt_message(&tampered).unwrap_err();

    assert_eq!(bob.session.decrypt_message(&c1).unwrap(), b"once");
    let replay_err = bob.session.decrypt_message(&c1).unwrap_err();
    let short_err = bob.session.decrypt_message(&c1[..40]).unwrap_err();

    for err in [tamper_err, replay_err, short_err] {
        assert!(matches!(err, CryptoError::DecryptionFailed));
        assert_eq!(err.to_string(), "decryption failed");
    }

    // The session still works after rejected input.
    let c2 = alice.session.encrypt_message(b"twice").unwrap();
    assert_eq!(bob.session.decrypt_message(&c2).unwrap(), b"twice");
}

#[test]
fn unsigned_bundles_never_establish() {
    let mut alice = Party::new("alice", "bob", 0);
    let bob = Party::new("bob", "alice", 0);
    let good = bob.prekeys.next_bundle().unwrap();

    let stripped = PreKeyBundle {
        signed_prekey_signature: Vec::new(),
        ..good.clone()
    };
    let zeroed = PreKeyBundle {
        signed_prekey_signature: vec![0u8; 64],
        ..good.clone()
    };
    let forged_signer = IdentityKeyPair::generate().unwrap();
    let forged = SignedPreKey::generate(&forged_signer, 1).unwrap();
    let swapped = PreKeyBundle {
        signed_prekey_signature: forged.signature().to_vec(),
        ..good
    };

    for bundle in [&stripped, &zeroed] {
        assert!(matches!(
            alice.session.establish_session(bundle),
            Err(CryptoError::MissingSignature)
        ));
    }
    assert!(matches!(
        alice.session.establish_session(&swapped),
        Err(CryptoError::InvalidSignature)
    ));
    assert!(!alice.session.is_established());
    assert!(alice.session.peer_identity().is_none());
}

#[test]
fn one_time_prekey_cannot_be_used_twice() {
    let mut bob = Party::new("bob", "alice", 1);
    let bundle = bob.prekeys.next_bundle().unwrap();
    assert_eq!(bundle.one_time_prekey_id, Some(1));

    let mut alice = Party::new("alice", "bob", 0);
    let first = alice.session.establish_session(&bundle).unwrap();
    bob.accept(&first).unwrap();

    // A second handshake against the same bundle (or a replay of the first).
    let mut eve = SignalSession::new(alice.identity.clone(), "alice", "bob");
    let second = eve.establish_session(&bundle).unwrap();
    for initial in [&first, &second] {
        assert!(matches!(
            bob.accept(initial),
            Err(CryptoError::OneTimePreKeyConsumed(1))
        ));
    }
}

// ── Identity rotation ────────────────────────────────────────────────

#[test]
fn rotation_transition_window() {
    let mut alice = Party::new("alice", "bob", 0);
    let mut bob = Party::new("bob", "alice", 2);
    connect(&mut alice, &mut bob);

    // Alice still holds a bundle signed by Bob's old identity.
    let old_bundle = bob.prekeys.next_bundle().unwrap();
    let old_identity = bob.identity.clone();

    bob.session.rotate_identity_key().unwrap();
    let new_identity = *bob.session.identity_public_key();
    assert_eq!(
        bob.session.previous_identity_public_key(),
        Some(old_identity.public_key())
    );

    alice.session.note_peer_identity_rotation(new_identity).unwrap();
    assert_eq!(alice.session.peer_identity(), Some(&new_identity));

    let initial = alice
        .session
        .handle_rotated_identity_key(&old_bundle)
        .unwrap();
    assert_eq!(initial.recipient_identity_key, *old_identity.public_key());
    bob.accept(&initial).unwrap();

    let c = alice.session.encrypt_message(b"across rotation").unwrap();
    assert_eq!(bob.session.decrypt_message(&c).unwrap(), b"across rotation");
    let c = bob.session.encrypt_message(b"ack").unwrap();
    assert_eq!(alice.session.decrypt_message(&c).unwrap(), b"ack");
}

#[test]
fn unannounced_identity_change_is_untrusted() {
    let mut alice = Party::new("alice", "bob", 0);
    let mut bob = Party::new("bob", "alice", 0);
    connect(&mut alice, &mut bob);

    let impostor = Party::new("bob", "alice", 0);
    let bundle = impostor.prekeys.next_bundle().unwrap();
    assert!(matches!(
        alice.session.handle_rotated_identity_key(&bundle),
        Err(CryptoError::UntrustedIdentity)
    ));
}

#[test]
fn rotated_session_keeps_running() {
    let mut alice = Party::new("alice", "bob", 1);
    let mut bob = Party::new("bob", "alice", 1);
    connect(&mut alice, &mut bob);

    alice.session.rotate_identity_key().unwrap();
    let c = alice.session.encrypt_message(b"same ratchet").unwrap();
    assert_eq!(bob.session.decrypt_message(&c).unwrap(), b"same ratchet");
}
