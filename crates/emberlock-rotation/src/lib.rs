//! Scheduled identity key rotation.
//!
//! [`IdentityKeyRotationManager`] owns no key material itself; it drives an
//! injected [`IdentityKeyStore`](emberlock_crypto::IdentityKeyStore) and
//! [`CompromiseDetector`](emberlock_crypto::CompromiseDetector) from a tokio
//! background task.

pub mod config;
pub mod error;
pub mod manager;

pub use config::RotationConfig;
pub use error::RotationError;
pub use manager::{IdentityKeyRotationManager, RotationHandle, RotationReport, RotationStatus};
