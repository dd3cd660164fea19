//! Identity pinning: the post-signature validation hook.
//!
//! The hook runs inside MessageA/B processing after the protocol signature
//! verified. A pinned peer must present a key whose fingerprint matches the
//! trust record; a first contact passes and yields a recommended trust
//! record for the pairing flow above to commit.

use crate::error::{HandshakeError, Result};
use crate::messages::WireIdentityKey;
use async_trait::async_trait;
use skybridge_core::DeviceId;
use skybridge_identity::{
    fingerprint, TrustRecord, TrustRecordUpdate, TrustStore, VerificationPath,
};
use std::sync::Arc;

/// Post-signature validation hook.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    /// Validates the peer's verified identity key.
    ///
    /// Returns a recommended trust-record update on first contact, `None`
    /// when the peer was already pinned.
    async fn validate(
        &self,
        peer: &DeviceId,
        identity: &WireIdentityKey,
    ) -> Result<Option<TrustRecordUpdate>>;
}

/// Validator that pins against a [`TrustStore`].
pub struct PinningValidator {
    trust: Arc<TrustStore>,
}

impl PinningValidator {
    /// Creates a validator over the given store.
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }
}

#[async_trait]
impl IdentityValidator for PinningValidator {
    async fn validate(
        &self,
        peer: &DeviceId,
        identity: &WireIdentityKey,
    ) -> Result<Option<TrustRecordUpdate>> {
        let actual = fingerprint(&identity.public_key);
        match self.trust.record(peer).await? {
            Some(record) => {
                if record.pub_key_fingerprint == actual {
                    Ok(None)
                } else {
                    Err(HandshakeError::IdentityMismatch {
                        expected: record.pub_key_fingerprint.clone(),
                        actual,
                    })
                }
            }
            None => {
                // First contact: no pin to enforce. Recommend a record so
                // the pairing flow can commit it after user confirmation.
                let mut record = TrustRecord::new(
                    peer.clone(),
                    identity.public_key.clone(),
                    identity.algorithm,
                );
                record.secure_enclave_public_key = identity.se_pop_public_key.clone();
                Ok(Some(TrustRecordUpdate {
                    record,
                    verification_path: VerificationPath::Modern(identity.algorithm),
                }))
            }
        }
    }
}

/// Validator that accepts every identity. Used where pinning is handled by
/// an outer pairing UI, and by tests.
#[derive(Debug, Default, Clone)]
pub struct AcceptAllValidator;

#[async_trait]
impl IdentityValidator for AcceptAllValidator {
    async fn validate(
        &self,
        _peer: &DeviceId,
        _identity: &WireIdentityKey,
    ) -> Result<Option<TrustRecordUpdate>> {
        Ok(None)
    }
}
