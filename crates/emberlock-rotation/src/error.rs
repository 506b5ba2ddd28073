use emberlock_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("identity key rotation is disabled")]
    Disabled,

    #[error("failed to read current identity key: {0}")]
    Lookup(#[source] CryptoError),

    #[error("failed to generate identity key after {attempts} attempts: {source}")]
    Generation { attempts: u32, source: CryptoError },

    #[error("generated identity key rejected: {0}")]
    InvalidKey(#[source] CryptoError),

    #[error("failed to store identity key after {attempts} attempts: {source}")]
    Storage { attempts: u32, source: CryptoError },

    #[error("new identity key stored but old keys are still valid: {0}")]
    Invalidation(#[source] CryptoError),

    #[error("invalid rotation config: {0}")]
    Config(#[from] serde_json::Error),
}
