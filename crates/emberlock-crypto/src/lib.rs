//! End-to-end session engine: X25519 key pairs, XEdDSA-signed pre-keys,
//! X3DH key agreement and Double Ratchet sessions.

pub mod error;
pub mod keys;
pub mod primitives;
pub mod signal;
pub mod xeddsa;

pub use error::{CryptoError, ErrorKind};
pub use keys::{generate_key_pair, shared_secret, IdentityKeyPair, KeyPair};
pub use signal::{
    CompromiseDetector, IdentityKeyStore, InitialMessage, PreKeyBundle, PreKeyStore, SignalSession,
};
