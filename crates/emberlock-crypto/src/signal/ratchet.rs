//! Double Ratchet state machine.
//!
//! Each direction has its own root chain. The sending side advances
//! `root_key` with a DH ratchet step whenever the peer has shown us a new
//! ratchet key, or after [`RATCHET_INTERVAL`] messages on one chain. Every
//! header names the receiver's ratchet key the step was computed against, so
//! the receiver can find the matching private half (current or retained) and
//! mirror the step on `recv_root_key`.
//!
//! Wire layout of a ratchet message:
//!
//! ```text
//! ratchet_key(32) || peer_ratchet_key(32) || prev_chain_len(u32 LE) || counter(u32 LE)
//!     || nonce(12) || ciphertext || tag(16)
//! ```
//!
//! The 72-byte header is authenticated as part of the associated data.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::keys::{fingerprint, KeyPair, KEY_LEN};
use crate::primitives::{decrypt_aead, encrypt_aead, hkdf_derive};

/// Messages sent on one chain before a DH ratchet step is forced.
pub const RATCHET_INTERVAL: u32 = 100;
/// Most counters a single received message may skip ahead.
pub const MAX_SKIP: u32 = 1000;
/// Previous sending ratchet keys kept so late replies can still be read.
pub const MAX_RETAINED_RATCHETS: usize = 32;
/// Serialized [`MessageHeader`] length.
pub const HEADER_LEN: usize = 2 * KEY_LEN + 8;

const ROOT_INFO: &[u8] = b"Emberlock_DoubleRatchetRoot";
const STEP_INFO: &[u8] = b"Emberlock_DoubleRatchetStep";
const MESSAGE_KEY_INFO: &[u8] = b"Emberlock_MessageKey";
const CHAIN_KEY_INFO: &[u8] = b"Emberlock_ChainKey";

/// Which side of the X3DH handshake a ratchet was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Plaintext, authenticated header of a ratchet message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; KEY_LEN],
    /// The receiver's ratchet public key the sender last stepped against.
    pub peer_ratchet_key: [u8; KEY_LEN],
    /// Messages sent on the sender's previous chain.
    pub prev_chain_len: u32,
    /// Position of this message in the sending chain.
    pub counter: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..KEY_LEN].copy_from_slice(&self.ratchet_key);
        bytes[KEY_LEN..2 * KEY_LEN].copy_from_slice(&self.peer_ratchet_key);
        bytes[2 * KEY_LEN..2 * KEY_LEN + 4].copy_from_slice(&self.prev_chain_len.to_le_bytes());
        bytes[2 * KEY_LEN + 4..].copy_from_slice(&self.counter.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut ratchet_key = [0u8; KEY_LEN];
        let mut peer_ratchet_key = [0u8; KEY_LEN];
        let mut prev_chain_len = [0u8; 4];
        let mut counter = [0u8; 4];
        ratchet_key.copy_from_slice(&bytes[..KEY_LEN]);
        peer_ratchet_key.copy_from_slice(&bytes[KEY_LEN..2 * KEY_LEN]);
        prev_chain_len.copy_from_slice(&bytes[2 * KEY_LEN..2 * KEY_LEN + 4]);
        counter.copy_from_slice(&bytes[2 * KEY_LEN + 4..]);
        Self {
            ratchet_key,
            peer_ratchet_key,
            prev_chain_len: u32::from_le_bytes(prev_chain_len),
            counter: u32::from_le_bytes(counter),
        }
    }

    /// Split a ratchet message into its header and AEAD body.
    pub fn split(message: &[u8]) -> Result<(Self, &[u8])> {
        if message.len() < HEADER_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (header, body) = message.split_at(HEADER_LEN);
        let header: &[u8; HEADER_LEN] = header
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok((Self::from_bytes(header), body))
    }
}

/// Live ratchet state of one session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DoubleRatchetState {
    /// Root of the chain we send on.
    root_key: [u8; KEY_LEN],
    /// Root of the chain the peer sends on.
    recv_root_key: [u8; KEY_LEN],
    chain_key_send: [u8; KEY_LEN],
    chain_key_recv: [u8; KEY_LEN],
    /// Last message keys used; cleared on every sending step.
    message_key_send: [u8; KEY_LEN],
    message_key_recv: [u8; KEY_LEN],
    send_ratchet: KeyPair,
    /// Newest ratchet public key the peer has used.
    recv_ratchet: [u8; KEY_LEN],
    prev_chain_len: u32,
    send_count: u32,
    recv_count: u32,
    /// The peer presented a ratchet key we have not stepped against yet.
    send_ratchet_due: bool,
    /// Earlier sending ratchet pairs, oldest first.
    retained_ratchets: Vec<KeyPair>,
    /// Root before the latest sending step, while no message has carried
    /// that step yet. A further step restarts from here so the peer never
    /// has to follow a step it could not see.
    unsent_step_root: Option<[u8; KEY_LEN]>,
}

/// A sending DH step computed but not yet applied.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SendStep {
    key_pair: KeyPair,
    root_key: [u8; KEY_LEN],
    chain_key: [u8; KEY_LEN],
}

/// Receiving state that becomes current once the AEAD check passes.
#[derive(Zeroize, ZeroizeOnDrop)]
struct ReceivePlan {
    /// `Some` when the message opened a new receiving chain.
    new_chain: Option<NewChain>,
    chain_key: [u8; KEY_LEN],
    message_key: [u8; KEY_LEN],
    next_counter: u32,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct NewChain {
    root_key: [u8; KEY_LEN],
    ratchet_key: [u8; KEY_LEN],
    /// Index into `retained_ratchets`, `None` for the current pair.
    matched: Option<usize>,
}

/// Derive the initial ratchet state from an X3DH shared secret.
///
/// `send_ratchet` is our first ratchet pair: a fresh key for the initiator,
/// the signed pre-key for the responder. `recv_ratchet` is the peer's
/// counterpart.
pub fn initialize_double_ratchet(
    shared_secret: &[u8; KEY_LEN],
    role: Role,
    send_ratchet: KeyPair,
    recv_ratchet: [u8; KEY_LEN],
) -> Result<DoubleRatchetState> {
    let mut okm = hkdf_derive::<{ 3 * KEY_LEN }>(shared_secret, Some(&[0u8; KEY_LEN]), ROOT_INFO)?;

    let mut initiator_root = [0u8; KEY_LEN];
    let mut responder_root = [0u8; KEY_LEN];
    let mut chain_key = [0u8; KEY_LEN];
    initiator_root.copy_from_slice(&okm[..KEY_LEN]);
    responder_root.copy_from_slice(&okm[KEY_LEN..2 * KEY_LEN]);
    chain_key.copy_from_slice(&okm[2 * KEY_LEN..]);
    okm.zeroize();

    // The responder's sending root is the initiator's receiving root.
    let (root_key, recv_root_key) = match role {
        Role::Initiator => (initiator_root, responder_root),
        Role::Responder => (responder_root, initiator_root),
    };
    initiator_root.zeroize();
    responder_root.zeroize();

    let state = DoubleRatchetState {
        root_key,
        recv_root_key,
        chain_key_send: chain_key,
        chain_key_recv: chain_key,
        message_key_send: [0u8; KEY_LEN],
        message_key_recv: [0u8; KEY_LEN],
        send_ratchet,
        recv_ratchet,
        prev_chain_len: 0,
        send_count: 0,
        recv_count: 0,
        send_ratchet_due: true,
        retained_ratchets: Vec::new(),
        unsent_step_root: None,
    };
    chain_key.zeroize();
    Ok(state)
}

/// One DH ratchet step: `DH(own_private, peer_public)` fed through HKDF
/// salted with the current root key. Returns `(new_root_key, new_chain_key)`.
pub fn ratchet_step(
    root_key: &[u8; KEY_LEN],
    peer_ratchet_public: &[u8; KEY_LEN],
    own_ratchet_private: &[u8; KEY_LEN],
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let mut dh = crate::keys::shared_secret(own_ratchet_private, peer_ratchet_public)?;
    let derived = hkdf_derive::<{ 2 * KEY_LEN }>(&dh, Some(root_key), STEP_INFO);
    dh.zeroize();
    let mut okm = derived?;

    let mut new_root = [0u8; KEY_LEN];
    let mut new_chain = [0u8; KEY_LEN];
    new_root.copy_from_slice(&okm[..KEY_LEN]);
    new_chain.copy_from_slice(&okm[KEY_LEN..]);
    okm.zeroize();
    Ok((new_root, new_chain))
}

/// Advance a chain by one message. Returns `(message_key, next_chain_key)`.
///
/// Both outputs come from one-way HKDF expansions of `chain_key`, so
/// neither reveals the input chain key.
pub fn derive_message_key(chain_key: &[u8; KEY_LEN]) -> Result<([u8; KEY_LEN], [u8; KEY_LEN])> {
    let message_key = hkdf_derive::<KEY_LEN>(chain_key, None, MESSAGE_KEY_INFO)?;
    let next_chain = hkdf_derive::<KEY_LEN>(chain_key, None, CHAIN_KEY_INFO)?;
    Ok((message_key, next_chain))
}

impl DoubleRatchetState {
    /// Our current ratchet public key.
    pub fn send_ratchet_public(&self) -> &[u8; KEY_LEN] {
        self.send_ratchet.public_key()
    }

    /// Newest peer ratchet public key.
    pub fn recv_ratchet(&self) -> &[u8; KEY_LEN] {
        &self.recv_ratchet
    }

    /// Messages sent on the current sending chain.
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Next expected counter on the current receiving chain.
    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    fn needs_send_step(&self) -> bool {
        self.send_ratchet_due || self.send_count >= RATCHET_INTERVAL
    }

    /// Run a sending DH step now if one is due. Returns whether it ran.
    pub fn perform_ratchet_if_needed(&mut self) -> Result<bool> {
        if !self.needs_send_step() {
            return Ok(false);
        }
        let step = self.plan_send_step()?;
        self.apply_send_step(&step);
        Ok(true)
    }

    fn plan_send_step(&self) -> Result<SendStep> {
        let key_pair = KeyPair::generate()?;
        let base = self.unsent_step_root.as_ref().unwrap_or(&self.root_key);
        let (root_key, chain_key) = ratchet_step(base, &self.recv_ratchet, key_pair.private_key())?;
        Ok(SendStep {
            key_pair,
            root_key,
            chain_key,
        })
    }

    fn apply_send_step(&mut self, step: &SendStep) {
        let previous = std::mem::replace(&mut self.send_ratchet, step.key_pair.clone());
        if self.unsent_step_root.is_none() {
            self.unsent_step_root = Some(self.root_key);
            self.prev_chain_len = self.send_count;
            self.retained_ratchets.push(previous);
            if self.retained_ratchets.len() > MAX_RETAINED_RATCHETS {
                self.retained_ratchets.remove(0);
            }
        }
        // Otherwise `previous` was never sent and is simply dropped.

        self.root_key = step.root_key;
        self.chain_key_send = step.chain_key;
        self.send_count = 0;
        self.send_ratchet_due = false;
        self.message_key_send.zeroize();
        self.message_key_recv.zeroize();

        tracing::debug!(
            ratchet_key = %fingerprint(self.send_ratchet.public_key()),
            prev_chain_len = self.prev_chain_len,
            "sending ratchet step"
        );
    }

    /// Encrypt one message. `associated_data` is extended with the header.
    ///
    /// State changes (including a due DH step) are applied only after the
    /// AEAD call succeeds.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let step = if self.needs_send_step() {
            Some(self.plan_send_step()?)
        } else {
            None
        };

        let header = match &step {
            Some(step) => MessageHeader {
                ratchet_key: *step.key_pair.public_key(),
                peer_ratchet_key: self.recv_ratchet,
                prev_chain_len: if self.unsent_step_root.is_some() {
                    self.prev_chain_len
                } else {
                    self.send_count
                },
                counter: 0,
            },
            None => MessageHeader {
                ratchet_key: *self.send_ratchet.public_key(),
                peer_ratchet_key: self.recv_ratchet,
                prev_chain_len: self.prev_chain_len,
                counter: self.send_count,
            },
        };
        let chain_key = step.as_ref().map_or(&self.chain_key_send, |s| &s.chain_key);
        let (message_key, next_chain) = derive_message_key(chain_key)?;

        let header_bytes = header.to_bytes();
        let body = encrypt_aead(&message_key, plaintext, &full_ad(associated_data, &header_bytes))?;

        if let Some(step) = step {
            self.apply_send_step(&step);
        }
        if let Some(mut root) = self.unsent_step_root.take() {
            root.zeroize();
        }
        self.chain_key_send = next_chain;
        self.message_key_send = message_key;
        self.send_count += 1;

        let mut output = Vec::with_capacity(HEADER_LEN + body.len());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(&body);
        Ok(output)
    }

    /// Decrypt one message produced by the peer's [`encrypt`](Self::encrypt).
    ///
    /// Every failure is [`CryptoError::DecryptionFailed`] and leaves the
    /// state untouched.
    pub fn decrypt(&mut self, message: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let (header, body) = MessageHeader::split(message)?;
        let plan = self
            .plan_receive(&header)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = decrypt_aead(
            &plan.message_key,
            body,
            &full_ad(associated_data, &header.to_bytes()),
        )?;

        self.apply_receive(&plan, &header);
        Ok(plaintext)
    }

    fn plan_receive(&self, header: &MessageHeader) -> Result<ReceivePlan> {
        let (new_chain, mut chain_key, position) = if header.ratchet_key == self.recv_ratchet {
            (None, self.chain_key_recv, self.recv_count)
        } else {
            let (matched, own) = self
                .own_ratchet(&header.peer_ratchet_key)
                .ok_or(CryptoError::DecryptionFailed)?;
            let (root_key, chain_key) =
                ratchet_step(&self.recv_root_key, &header.ratchet_key, own.private_key())?;
            let new_chain = NewChain {
                root_key,
                ratchet_key: header.ratchet_key,
                matched,
            };
            (Some(new_chain), chain_key, 0)
        };

        // Counters behind the chain position are replays.
        if header.counter < position || header.counter - position > MAX_SKIP {
            chain_key.zeroize();
            return Err(CryptoError::DecryptionFailed);
        }
        for _ in position..header.counter {
            let (mut skipped, next) = derive_message_key(&chain_key)?;
            skipped.zeroize();
            chain_key = next;
        }

        let next_counter = header
            .counter
            .checked_add(1)
            .ok_or(CryptoError::DecryptionFailed)?;
        let (message_key, next_chain) = derive_message_key(&chain_key)?;
        chain_key.zeroize();
        Ok(ReceivePlan {
            new_chain,
            chain_key: next_chain,
            message_key,
            next_counter,
        })
    }

    fn apply_receive(&mut self, plan: &ReceivePlan, header: &MessageHeader) {
        if let Some(new_chain) = &plan.new_chain {
            if self.recv_count < header.prev_chain_len {
                tracing::debug!(
                    missed = header.prev_chain_len - self.recv_count,
                    "messages on previous receiving chain never arrived"
                );
            }
            self.recv_root_key = new_chain.root_key;
            self.recv_ratchet = new_chain.ratchet_key;
            self.send_ratchet_due = true;
            // The peer has moved past every ratchet key older than the match.
            match new_chain.matched {
                Some(index) => {
                    self.retained_ratchets.drain(..index);
                }
                None => self.retained_ratchets.clear(),
            }
            tracing::debug!(
                ratchet_key = %fingerprint(&new_chain.ratchet_key),
                "receiving ratchet step"
            );
        }
        self.chain_key_recv = plan.chain_key;
        self.message_key_recv = plan.message_key;
        self.recv_count = plan.next_counter;
    }

    fn own_ratchet(&self, public: &[u8; KEY_LEN]) -> Option<(Option<usize>, &KeyPair)> {
        if self.send_ratchet.public_key() == public {
            return Some((None, &self.send_ratchet));
        }
        self.retained_ratchets
            .iter()
            .enumerate()
            .rev()
            .find(|(_, pair)| pair.public_key() == public)
            .map(|(index, pair)| (Some(index), pair))
    }
}

impl std::fmt::Debug for DoubleRatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchetState")
            .field("send_ratchet", &fingerprint(self.send_ratchet.public_key()))
            .field("recv_ratchet", &fingerprint(&self.recv_ratchet))
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("prev_chain_len", &self.prev_chain_len)
            .finish_non_exhaustive()
    }
}

fn full_ad(prefix: &[u8], header: &[u8; HEADER_LEN]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(prefix.len() + HEADER_LEN);
    ad.extend_from_slice(prefix);
    ad.extend_from_slice(header);
    ad
}
