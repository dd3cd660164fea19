//! Key material containers and length tables.

use crate::error::{CryptoError, Result};
use crate::suite::{CipherSuite, SignatureAlgorithm};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// X25519 public key / secret scalar length.
pub const X25519_KEY_LEN: usize = 32;

/// Ed25519 seed length.
pub const ED25519_SEED_LEN: usize = 32;
/// Ed25519 seed+public keypair length.
pub const ED25519_KEYPAIR_LEN: usize = 64;
/// Ed25519 public key length.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;
/// Ed25519 signature length.
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// ML-DSA-65 public key length.
pub const MLDSA65_PUBLIC_KEY_LEN: usize = 1952;
/// ML-DSA-65 expanded secret key length (this provider).
pub const MLDSA65_SECRET_KEY_LEN: usize = 4000;
/// ML-DSA-65 expanded secret key length used by FIPS-204 reference encoders.
pub const MLDSA65_SECRET_KEY_LEN_FIPS: usize = 4032;
/// ML-DSA-65 seed-form secret length.
pub const MLDSA65_SEED_LEN: usize = 64;
/// ML-DSA-65 signature length.
pub const MLDSA65_SIGNATURE_LEN: usize = 3309;

/// ML-KEM-768 public key length.
pub const MLKEM768_PUBLIC_KEY_LEN: usize = 1184;
/// ML-KEM-768 secret key length (expanded form).
pub const MLKEM768_SECRET_KEY_LEN: usize = 2400;
/// ML-KEM-768 secret key length (seed form used by seed-based providers).
pub const MLKEM768_SEED_LEN: usize = 96;
/// ML-KEM-768 ciphertext length.
pub const MLKEM768_CIPHERTEXT_LEN: usize = 1088;

/// X-Wing public key length (X25519 ‖ ML-KEM-768).
pub const XWING_PUBLIC_KEY_LEN: usize = X25519_KEY_LEN + MLKEM768_PUBLIC_KEY_LEN;
/// X-Wing secret key length (expanded form).
pub const XWING_SECRET_KEY_LEN: usize = X25519_KEY_LEN + MLKEM768_SECRET_KEY_LEN;
/// X-Wing secret key length (seed form).
pub const XWING_SEED_LEN: usize = 64;
/// X-Wing encapsulation length (ephemeral X25519 ‖ ML-KEM ciphertext).
pub const XWING_CIPHERTEXT_LEN: usize = X25519_KEY_LEN + MLKEM768_CIPHERTEXT_LEN;

/// P-256 uncompressed SEC1 public key length.
pub const P256_PUBLIC_KEY_LEN: usize = 65;
/// P-256 secret scalar length.
pub const P256_SECRET_KEY_LEN: usize = 32;
/// P-256 ECDSA fixed-width signature length.
pub const P256_SIGNATURE_LEN: usize = 64;

/// Shared secret output of any KEM in this crate.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Callback-based signer for HSM or remote-sign deployments.
pub trait RemoteSigner: Send + Sync {
    /// Signs a message with the remote key.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Public key of the remote signing key.
    fn public_key(&self) -> Vec<u8>;
}

/// Reference to private signing-key material.
///
/// Identity and PoP keys come in three shapes: raw software bytes, an opaque
/// reference into hardware-backed storage, or a signing callback. The driver
/// validates the shape against the algorithm at construction.
#[derive(Clone)]
pub enum KeyHandle {
    /// Raw private key bytes held in process memory. Zeroized on drop.
    SoftwareBytes(Zeroizing<Vec<u8>>),

    /// Opaque platform reference (keychain tag / Secure Enclave handle).
    /// Hardware references only ever carry P-256 keys.
    HardwareRef(String),

    /// Remote signing callback.
    Callback(Arc<dyn RemoteSigner>),
}

impl KeyHandle {
    /// Wraps software key bytes.
    pub fn software(bytes: Vec<u8>) -> Self {
        Self::SoftwareBytes(Zeroizing::new(bytes))
    }

    /// Validates that this handle can back the given signature algorithm.
    pub fn validate_for(&self, algorithm: SignatureAlgorithm) -> Result<()> {
        match self {
            Self::SoftwareBytes(bytes) => {
                let len = bytes.len();
                let ok = match algorithm {
                    SignatureAlgorithm::Ed25519 => {
                        len == ED25519_SEED_LEN || len == ED25519_KEYPAIR_LEN
                    }
                    SignatureAlgorithm::MlDsa65 => {
                        len == MLDSA65_SEED_LEN
                            || len == MLDSA65_SECRET_KEY_LEN
                            || len == MLDSA65_SECRET_KEY_LEN_FIPS
                    }
                    SignatureAlgorithm::P256Ecdsa => len == P256_SECRET_KEY_LEN,
                };
                if ok {
                    Ok(())
                } else {
                    Err(CryptoError::InvalidKeyLength {
                        algorithm: algorithm.name(),
                        expected: expected_signing_key_lengths(algorithm),
                        actual: len,
                    })
                }
            }
            Self::HardwareRef(_) => {
                if algorithm == SignatureAlgorithm::P256Ecdsa {
                    Ok(())
                } else {
                    Err(CryptoError::InvalidProviderType {
                        algorithm: algorithm.name(),
                        detail: "hardware-backed references only carry P-256 keys".into(),
                    })
                }
            }
            Self::Callback(_) => Ok(()),
        }
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SoftwareBytes(bytes) => f
                .debug_struct("KeyHandle::SoftwareBytes")
                .field("len", &bytes.len())
                .finish(),
            Self::HardwareRef(tag) => f
                .debug_struct("KeyHandle::HardwareRef")
                .field("tag", tag)
                .finish(),
            Self::Callback(_) => f.write_str("KeyHandle::Callback"),
        }
    }
}

fn expected_signing_key_lengths(algorithm: SignatureAlgorithm) -> &'static str {
    match algorithm {
        SignatureAlgorithm::Ed25519 => "32 or 64",
        SignatureAlgorithm::MlDsa65 => "64, 4000 or 4032",
        SignatureAlgorithm::P256Ecdsa => "32",
    }
}

/// Accepted public-key lengths for a suite's KEM identity key.
pub fn kem_public_key_lengths(suite: CipherSuite) -> &'static [usize] {
    match suite {
        CipherSuite::X25519Ed25519 => &[X25519_KEY_LEN],
        CipherSuite::P256Ecdsa => &[P256_PUBLIC_KEY_LEN],
        CipherSuite::MlKem768MlDsa65 => &[MLKEM768_PUBLIC_KEY_LEN],
        CipherSuite::XWingMlDsa => &[XWING_PUBLIC_KEY_LEN],
    }
}

/// Accepted secret-key lengths for a suite's KEM identity key.
///
/// Seed forms written by seed-based providers remain readable so records
/// persisted before the current provider are not thrown away.
pub fn kem_secret_key_lengths(suite: CipherSuite) -> &'static [usize] {
    match suite {
        CipherSuite::X25519Ed25519 => &[X25519_KEY_LEN],
        CipherSuite::P256Ecdsa => &[P256_SECRET_KEY_LEN],
        CipherSuite::MlKem768MlDsa65 => &[MLKEM768_SECRET_KEY_LEN, MLKEM768_SEED_LEN],
        CipherSuite::XWingMlDsa => &[XWING_SECRET_KEY_LEN, XWING_SEED_LEN],
    }
}

/// A KEM keypair bound to the suite it was generated for.
#[derive(Clone)]
pub struct KemKeypair {
    /// Suite the keypair serves.
    pub suite: CipherSuite,

    /// Public key bytes.
    pub public_key: Vec<u8>,

    /// Secret key bytes. Zeroized on drop.
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl KemKeypair {
    /// Validates the keypair lengths against the suite's table.
    pub fn validate(&self) -> Result<()> {
        if !kem_public_key_lengths(self.suite).contains(&self.public_key.len()) {
            return Err(CryptoError::InvalidKeyLength {
                algorithm: self.suite.name(),
                expected: "suite public-key length",
                actual: self.public_key.len(),
            });
        }
        if !kem_secret_key_lengths(self.suite).contains(&self.secret_key.len()) {
            return Err(CryptoError::InvalidKeyLength {
                algorithm: self.suite.name(),
                expected: "suite secret-key length",
                actual: self.secret_key.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for KemKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemKeypair")
            .field("suite", &self.suite)
            .field("public_key_len", &self.public_key.len())
            .field("secret_key_len", &self.secret_key.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_handle_lengths_are_checked() {
        assert!(KeyHandle::software(vec![0u8; 32])
            .validate_for(SignatureAlgorithm::Ed25519)
            .is_ok());
        assert!(KeyHandle::software(vec![0u8; 64])
            .validate_for(SignatureAlgorithm::Ed25519)
            .is_ok());
        assert!(KeyHandle::software(vec![0u8; 33])
            .validate_for(SignatureAlgorithm::Ed25519)
            .is_err());
        assert!(KeyHandle::software(vec![0u8; 4000])
            .validate_for(SignatureAlgorithm::MlDsa65)
            .is_ok());
    }

    #[test]
    fn hardware_refs_are_p256_only() {
        let handle = KeyHandle::HardwareRef("se.pop.key".into());
        assert!(handle.validate_for(SignatureAlgorithm::P256Ecdsa).is_ok());
        assert!(matches!(
            handle.validate_for(SignatureAlgorithm::Ed25519),
            Err(CryptoError::InvalidProviderType { .. })
        ));
        assert!(handle.validate_for(SignatureAlgorithm::MlDsa65).is_err());
    }

    #[test]
    fn debug_never_prints_key_bytes() {
        let handle = KeyHandle::software(vec![0xAB; 32]);
        let debug = format!("{handle:?}");
        assert!(!debug.contains("AB"));
        assert!(debug.contains("len"));
    }
}
