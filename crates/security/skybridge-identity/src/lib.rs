//! # SkyBridge Identity
//!
//! Long-term key lifecycle for SkyBridge devices: protocol signing keys
//! (Ed25519 and ML-DSA-65, coexisting), per-suite KEM identity keys,
//! the optional hardware-backed Secure-Enclave proof-of-possession key, and
//! the trust records identity pinning is built on.
//!
//! Everything long-lived goes through the [`storage::SecureStorage`] trait;
//! records survive process restarts and are only ever rotated through
//! explicit operations.

#![warn(missing_docs)]

pub mod error;
pub mod manager;
pub mod storage;
pub mod trust;

pub use error::{IdentityError, Result};
pub use manager::{IdentityKeyManager, SecureEnclaveMode, SePop};
pub use storage::{FileStorage, MemoryStorage, SecureStorage};
pub use trust::{
    fingerprint, KeyUpgradeRequest, TrustRecord, TrustRecordUpdate, TrustStore, VerificationPath,
};
