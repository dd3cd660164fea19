//! # SkyBridge Crypto
//!
//! Cipher suites and the provider layer beneath the SkyBridge handshake.
//!
//! The crate is organized around three tiers:
//! - **Classic**: X25519 key agreement with Ed25519 identity signatures
//! - **PQC**: ML-KEM-768 encapsulation with ML-DSA-65 identity signatures
//! - **Hybrid**: X-Wing style X25519 ⊕ ML-KEM-768 with ML-DSA-65 signatures
//!
//! Each tier is exposed through the [`provider::CryptoProvider`] trait so the
//! handshake never touches an algorithm crate directly. P-256 appears only as
//! a legacy verifier and as the Secure-Enclave proof-of-possession primitive;
//! it is never a protocol signing algorithm.

#![warn(missing_docs)]

pub mod aead;
pub mod capabilities;
pub mod error;
pub mod kem;
pub mod keys;
pub mod provider;
pub mod sign;
pub mod suite;

pub use aead::SealedBox;
pub use capabilities::CryptoCapabilities;
pub use error::{CryptoError, Result};
pub use keys::{KemKeypair, KeyHandle, RemoteSigner, SharedSecret};
pub use provider::{ClassicProvider, CryptoProvider, HybridProvider, MlKemProvider, ProviderRegistry};
pub use sign::{protocol_signer_from_handle, verify_signature, ProtocolSigner};
pub use suite::{AeadAlgorithm, CipherSuite, KemAlgorithm, SignatureAlgorithm};
