//! Protocol signatures (Ed25519, ML-DSA-65) and the legacy / PoP P-256
//! verifier.

use crate::error::{CryptoError, Result};
use crate::keys::{
    KeyHandle, RemoteSigner, ED25519_KEYPAIR_LEN, ED25519_SEED_LEN, MLDSA65_SECRET_KEY_LEN,
    MLDSA65_SIGNATURE_LEN, P256_SIGNATURE_LEN,
};
use crate::suite::SignatureAlgorithm;
use ed25519_dalek::{Signer as _, Verifier as _};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as _, SecretKey as _,
};
use std::sync::Arc;

/// A signer bound to one protocol signing algorithm.
pub trait ProtocolSigner: Send + Sync {
    /// Algorithm this signer produces.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Public key corresponding to the signing key.
    fn public_key(&self) -> Vec<u8>;

    /// Signs a preimage.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Generates a fresh keypair for a protocol signing algorithm.
///
/// Returns `(public_key, secret_key)`; Ed25519 secrets are 32-byte seeds,
/// ML-DSA-65 secrets are the expanded form.
pub fn generate_signing_keypair(algorithm: SignatureAlgorithm) -> Result<(Vec<u8>, Vec<u8>)> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let mut seed = [0u8; ED25519_SEED_LEN];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut seed);
            let key = ed25519_dalek::SigningKey::from_bytes(&seed);
            Ok((key.verifying_key().to_bytes().to_vec(), seed.to_vec()))
        }
        SignatureAlgorithm::MlDsa65 => {
            let (pk, sk) = dilithium3::keypair();
            Ok((pk.as_bytes().to_vec(), sk.as_bytes().to_vec()))
        }
        SignatureAlgorithm::P256Ecdsa => Err(CryptoError::InvalidAlgorithmForProtocolSigning(
            algorithm,
        )),
    }
}

/// Builds a protocol signer from a key handle.
///
/// Rejects P-256 outright, hardware references for software algorithms, and
/// key material whose length or derived public key does not match.
pub fn protocol_signer_from_handle(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    handle: &KeyHandle,
) -> Result<Box<dyn ProtocolSigner>> {
    if !algorithm.is_protocol_signing() {
        return Err(CryptoError::InvalidAlgorithmForProtocolSigning(algorithm));
    }
    handle.validate_for(algorithm)?;

    match handle {
        KeyHandle::SoftwareBytes(bytes) => match algorithm {
            SignatureAlgorithm::Ed25519 => {
                let seed: [u8; ED25519_SEED_LEN] = match bytes.len() {
                    ED25519_SEED_LEN => bytes.as_slice().try_into().unwrap(),
                    ED25519_KEYPAIR_LEN => bytes[..ED25519_SEED_LEN].try_into().unwrap(),
                    _ => unreachable!("validated above"),
                };
                let key = ed25519_dalek::SigningKey::from_bytes(&seed);
                if key.verifying_key().to_bytes() != public_key {
                    return Err(CryptoError::InvalidKey(
                        "Ed25519 handle does not match the advertised public key".into(),
                    ));
                }
                Ok(Box::new(Ed25519Signer { key }))
            }
            SignatureAlgorithm::MlDsa65 => {
                if bytes.len() != MLDSA65_SECRET_KEY_LEN {
                    return Err(CryptoError::InvalidKey(format!(
                        "ML-DSA-65 key of {} bytes is not usable by this provider",
                        bytes.len()
                    )));
                }
                let secret = dilithium3::SecretKey::from_bytes(bytes).map_err(|e| {
                    CryptoError::InvalidKey(format!("invalid ML-DSA-65 secret key: {e:?}"))
                })?;
                Ok(Box::new(MlDsa65Signer {
                    secret,
                    public_key: public_key.to_vec(),
                }))
            }
            SignatureAlgorithm::P256Ecdsa => unreachable!("rejected above"),
        },
        KeyHandle::HardwareRef(_) => unreachable!("validate_for rejects non-P256 hardware refs"),
        KeyHandle::Callback(remote) => Ok(Box::new(CallbackSigner {
            algorithm,
            public_key: public_key.to_vec(),
            remote: Arc::clone(remote),
        })),
    }
}

/// Verifies a signature for any known algorithm, including the legacy P-256
/// path. Comparison failures all collapse to `VerificationFailed`.
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key_bytes: [u8; 32] = public_key
                .try_into()
                .map_err(|_| CryptoError::VerificationFailed)?;
            let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| CryptoError::VerificationFailed)?;
            let signature = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|_| CryptoError::VerificationFailed)?;
            key.verify(message, &signature)
                .map_err(|_| CryptoError::VerificationFailed)
        }
        SignatureAlgorithm::MlDsa65 => {
            if signature.len() != MLDSA65_SIGNATURE_LEN {
                return Err(CryptoError::VerificationFailed);
            }
            let key = dilithium3::PublicKey::from_bytes(public_key)
                .map_err(|_| CryptoError::VerificationFailed)?;
            let signature = dilithium3::DetachedSignature::from_bytes(signature)
                .map_err(|_| CryptoError::VerificationFailed)?;
            dilithium3::verify_detached_signature(&signature, message, &key)
                .map_err(|_| CryptoError::VerificationFailed)
        }
        SignatureAlgorithm::P256Ecdsa => {
            if signature.len() != P256_SIGNATURE_LEN {
                return Err(CryptoError::VerificationFailed);
            }
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| CryptoError::VerificationFailed)?;
            let signature = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| CryptoError::VerificationFailed)?;
            use p256::ecdsa::signature::Verifier;
            key.verify(message, &signature)
                .map_err(|_| CryptoError::VerificationFailed)
        }
    }
}

struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

impl ProtocolSigner for Ed25519Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }
}

struct MlDsa65Signer {
    secret: dilithium3::SecretKey,
    public_key: Vec<u8>,
}

impl ProtocolSigner for MlDsa65Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::MlDsa65
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = dilithium3::detached_sign(message, &self.secret);
        Ok(signature.as_bytes().to_vec())
    }
}

struct CallbackSigner {
    algorithm: SignatureAlgorithm,
    public_key: Vec<u8>,
    remote: Arc<dyn RemoteSigner>,
}

impl ProtocolSigner for CallbackSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.remote.sign(message)
    }
}

/// Software P-256 signer.
///
/// Stands in for the Secure Enclave on platforms without one and signs the
/// legacy half of dual-signature key upgrades in tests. Never a protocol
/// signer.
pub struct SoftwareP256Signer {
    key: p256::ecdsa::SigningKey,
}

impl SoftwareP256Signer {
    /// Generates a fresh P-256 keypair.
    pub fn generate() -> Self {
        Self {
            key: p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restores a signer from a 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let key = p256::ecdsa::SigningKey::from_slice(bytes)
            .map_err(|_| CryptoError::InvalidKey("invalid P-256 secret scalar".into()))?;
        Ok(Self { key })
    }

    /// Secret scalar bytes.
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.key.to_bytes().to_vec()
    }

    /// Uncompressed SEC1 public key.
    pub fn public_key(&self) -> Vec<u8> {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        self.key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Produces a fixed-width 64-byte ECDSA signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        use p256::ecdsa::signature::Signer;
        let signature: p256::ecdsa::Signature = self.key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }
}
