//! Error types for the crypto layer.

use crate::suite::{CipherSuite, SignatureAlgorithm};
use thiserror::Error;

/// Type alias for Results in this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors produced by cipher-suite providers and primitives.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material failed structural validation.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Key bytes had a length not valid for the algorithm.
    #[error("Invalid key length for {algorithm}: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Algorithm the key was presented for.
        algorithm: &'static str,
        /// Accepted lengths, human readable.
        expected: &'static str,
        /// Length that was presented.
        actual: usize,
    },

    /// KEM encapsulation failed.
    #[error("Encapsulation failed: {0}")]
    Encapsulation(String),

    /// KEM decapsulation failed.
    #[error("Decapsulation failed: {0}")]
    Decapsulation(String),

    /// AEAD sealing failed.
    #[error("Seal failed: {0}")]
    Seal(String),

    /// AEAD opening failed (includes authentication-tag mismatch).
    #[error("Open failed: {0}")]
    Open(String),

    /// Signing failed.
    #[error("Signing failed: {0}")]
    Sign(String),

    /// A signature did not verify. Carries no detail on purpose.
    #[error("Signature verification failed")]
    VerificationFailed,

    /// HKDF expansion failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// The provider does not implement this suite.
    #[error("Suite not supported by this provider: {0}")]
    UnsupportedSuite(CipherSuite),

    /// A wire id did not map to any known suite.
    #[error("Unknown cipher suite wire id: {0:#06x}")]
    UnknownSuite(u16),

    /// A key handle's variant is not usable for the requested algorithm.
    #[error("Invalid provider type for {algorithm}: {detail}")]
    InvalidProviderType {
        /// Algorithm the handle was presented for.
        algorithm: &'static str,
        /// What made the handle unusable.
        detail: String,
    },

    /// The algorithm may never produce protocol signatures.
    #[error("{0} is not a valid protocol signing algorithm")]
    InvalidAlgorithmForProtocolSigning(SignatureAlgorithm),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        let err = CryptoError::UnknownSuite(0xBEEF);
        assert_eq!(err.to_string(), "Unknown cipher suite wire id: 0xbeef");

        let err = CryptoError::InvalidAlgorithmForProtocolSigning(SignatureAlgorithm::P256Ecdsa);
        assert!(err.to_string().contains("p256_ecdsa"));
    }
}
