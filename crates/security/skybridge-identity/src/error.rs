//! Error types for identity and trust management.

use thiserror::Error;

/// Type alias for Results in this crate.
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Errors produced by the identity manager and trust store.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Secure storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A persisted record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An underlying crypto operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] skybridge_crypto::CryptoError),

    /// A persisted key's length does not match any accepted form.
    #[error("Persisted key for {context} has invalid length {actual}")]
    KeyLength {
        /// Which record the key came from.
        context: String,
        /// The offending length.
        actual: usize,
    },

    /// The platform has no Secure Enclave (or the entitlement is missing).
    #[error("Secure Enclave is not available on this platform")]
    SecureEnclaveUnavailable,

    /// A dual-signature key upgrade failed verification.
    #[error("Key upgrade rejected: {0}")]
    MigrationRejected(String),

    /// No trust record exists for the device.
    #[error("No trust record for device {0}")]
    UnknownDevice(String),
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        IdentityError::Storage(err.to_string())
    }
}
