use thiserror::Error;

/// Coarse classification used by callers to decide between alerting,
/// retrying, and treating a failure as a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Possible attack. Never retry with the same inputs.
    SecurityViolation,
    /// RNG or storage hiccup. Safe to retry a bounded number of times.
    Transient,
    /// The caller drove a session through an invalid state transition.
    ProtocolState,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("missing signed pre-key signature: security requirement violated")]
    MissingSignature,

    #[error("invalid signed pre-key signature: potential MITM attack detected")]
    InvalidSignature,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("peer identity key does not match the pinned identity")]
    UntrustedIdentity,

    #[error("one-time prekey {0} was already consumed")]
    OneTimePreKeyConsumed(u32),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    SigningError(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("session not established")]
    SessionNotEstablished,

    #[error("initial message addressed to an unknown identity key")]
    UnknownRecipientIdentity,

    #[error("identity key rotation failed: {0}")]
    RotationError(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingSignature
            | Self::InvalidSignature
            | Self::DecryptionFailed
            | Self::UntrustedIdentity
            | Self::OneTimePreKeyConsumed(_) => ErrorKind::SecurityViolation,
            Self::KeyGeneration(_) | Self::StorageError(_) => ErrorKind::Transient,
            Self::KeyDerivation(_)
            | Self::EncryptionError(_)
            | Self::InvalidKey(_)
            | Self::SigningError(_)
            | Self::PreKeyError(_)
            | Self::SessionNotEstablished
            | Self::UnknownRecipientIdentity
            | Self::RotationError(_) => ErrorKind::ProtocolState,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        self.kind() == ErrorKind::SecurityViolation
    }

    /// Whether a bounded retry with fresh inputs may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
