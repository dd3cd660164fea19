//! Trust records and the store identity pinning reads from.
//!
//! A record is created on first successful pairing and only changes through
//! the explicit update paths here; nothing ever downgrades one silently.

use crate::error::{IdentityError, Result};
use crate::storage::{serde_hex, SecureStorage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skybridge_core::{DeviceId, EventSink, SecurityEvent};
use skybridge_crypto::{verify_signature, CipherSuite, SignatureAlgorithm};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const TRUST_KEY_PREFIX: &str = "trust/";

/// Domain tag for the legacy-key half of a dual-signature upgrade.
const UPGRADE_OLD_OVER_NEW_TAG: &[u8] = b"SkyBridge-KeyUpgrade-OldOverNew";
/// Domain tag for the new-key half of a dual-signature upgrade.
const UPGRADE_NEW_OVER_OLD_TAG: &[u8] = b"SkyBridge-KeyUpgrade-NewOverOld";

/// SHA-256 fingerprint of a public key, lowercase hex.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Everything pinned about a peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// The peer's stable device id.
    pub device_id: DeviceId,

    /// SHA-256 hex fingerprint of `protocol_public_key`.
    pub pub_key_fingerprint: String,

    /// The pinned protocol signing public key.
    #[serde(with = "serde_hex")]
    pub protocol_public_key: Vec<u8>,

    /// Algorithm of the pinned key.
    pub signature_algorithm: SignatureAlgorithm,

    /// Retired P-256 key kept for legacy verification, if any.
    #[serde(default, with = "serde_hex::option")]
    pub legacy_p256_public_key: Option<Vec<u8>>,

    /// Whether signatures from the legacy key are still acceptable.
    pub allows_legacy_fallback: bool,

    /// Pinned KEM identity public keys by suite wire id.
    pub kem_public_keys: BTreeMap<u16, KemPublicKeyEntry>,

    /// Pinned Secure-Enclave PoP public key, if any.
    #[serde(default, with = "serde_hex::option")]
    pub secure_enclave_public_key: Option<Vec<u8>>,

    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Hex-encoded KEM public key entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPublicKeyEntry(#[serde(with = "serde_hex")] pub Vec<u8>);

impl TrustRecord {
    /// Starts a record for a newly paired device.
    pub fn new(
        device_id: DeviceId,
        protocol_public_key: Vec<u8>,
        signature_algorithm: SignatureAlgorithm,
    ) -> Self {
        Self {
            device_id,
            pub_key_fingerprint: fingerprint(&protocol_public_key),
            protocol_public_key,
            signature_algorithm,
            legacy_p256_public_key: None,
            allows_legacy_fallback: false,
            kem_public_keys: BTreeMap::new(),
            secure_enclave_public_key: None,
            updated_at: Utc::now(),
        }
    }

    /// The pinned KEM public key for a suite, if any.
    pub fn kem_public_key(&self, suite: CipherSuite) -> Option<&[u8]> {
        self.kem_public_keys
            .get(&suite.wire_id())
            .map(|entry| entry.0.as_slice())
    }

    /// Pins a KEM public key for a suite.
    pub fn set_kem_public_key(&mut self, suite: CipherSuite, public_key: Vec<u8>) {
        self.kem_public_keys
            .insert(suite.wire_id(), KemPublicKeyEntry(public_key));
        self.updated_at = Utc::now();
    }
}

/// Which verification path authenticated a peer on first contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPath {
    /// Modern Ed25519 / ML-DSA-65 protocol signature.
    Modern(SignatureAlgorithm),

    /// Legacy P-256 verification.
    LegacyP256,
}

/// A recommended trust-record write produced by first-contact pinning.
///
/// The pinning hook never writes records itself; the pairing flow above the
/// handshake decides whether to commit the recommendation.
#[derive(Debug, Clone)]
pub struct TrustRecordUpdate {
    /// The record to persist.
    pub record: TrustRecord,

    /// How the peer was verified when the recommendation was produced.
    pub verification_path: VerificationPath,
}

/// Dual-signature binding that migrates a pinned identity from legacy P-256
/// to Ed25519.
#[derive(Debug, Clone)]
pub struct KeyUpgradeRequest {
    /// The currently pinned P-256 public key.
    pub old_p256_public_key: Vec<u8>,

    /// The replacement Ed25519 public key.
    pub new_ed25519_public_key: Vec<u8>,

    /// P-256 signature by the old key over the new key.
    pub sig_old_over_new: Vec<u8>,

    /// Ed25519 signature by the new key over the old key.
    pub sig_new_over_old: Vec<u8>,
}

impl KeyUpgradeRequest {
    /// Preimage the old key must have signed.
    pub fn old_over_new_preimage(new_ed25519_public_key: &[u8]) -> Vec<u8> {
        let mut preimage = UPGRADE_OLD_OVER_NEW_TAG.to_vec();
        preimage.extend_from_slice(new_ed25519_public_key);
        preimage
    }

    /// Preimage the new key must have signed.
    pub fn new_over_old_preimage(old_p256_public_key: &[u8]) -> Vec<u8> {
        let mut preimage = UPGRADE_NEW_OVER_OLD_TAG.to_vec();
        preimage.extend_from_slice(old_p256_public_key);
        preimage
    }
}

/// Read-mostly store of trust records.
///
/// Readers get immutable snapshots (`Arc<TrustRecord>`); all writes go
/// through the update APIs, which write through to storage before touching
/// the cache.
pub struct TrustStore {
    storage: Arc<dyn SecureStorage>,
    events: Arc<dyn EventSink>,
    cache: RwLock<HashMap<DeviceId, Arc<TrustRecord>>>,
}

impl TrustStore {
    /// Creates a store over the given storage.
    pub fn new(storage: Arc<dyn SecureStorage>, events: Arc<dyn EventSink>) -> Self {
        Self {
            storage,
            events,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the record for a device, if one exists.
    pub async fn record(&self, device_id: &DeviceId) -> Result<Option<Arc<TrustRecord>>> {
        if let Some(record) = self.cache.read().get(device_id) {
            return Ok(Some(record.clone()));
        }
        let key = format!("{TRUST_KEY_PREFIX}{}", device_id.as_str());
        match self.storage.get(&key).await? {
            Some(bytes) => {
                let record: TrustRecord = serde_json::from_slice(&bytes)?;
                let record = Arc::new(record);
                self.cache
                    .write()
                    .insert(device_id.clone(), record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Creates or replaces a record.
    pub async fn upsert(&self, record: TrustRecord) -> Result<()> {
        let key = format!("{TRUST_KEY_PREFIX}{}", record.device_id.as_str());
        self.storage.put(&key, serde_json::to_vec(&record)?).await?;
        self.cache
            .write()
            .insert(record.device_id.clone(), Arc::new(record));
        Ok(())
    }

    /// Applies a dual-signature key upgrade for `device_id`.
    ///
    /// Both signatures must verify against the pinned old key and the
    /// candidate new key; on success the record is re-pinned to the Ed25519
    /// key and the retired P-256 key is kept for legacy verification.
    pub async fn apply_key_upgrade(
        &self,
        device_id: &DeviceId,
        request: &KeyUpgradeRequest,
    ) -> Result<Arc<TrustRecord>> {
        let current = self
            .record(device_id)
            .await?
            .ok_or_else(|| IdentityError::UnknownDevice(device_id.as_str().to_string()))?;

        let pinned_old = match (&current.signature_algorithm, &current.legacy_p256_public_key) {
            (SignatureAlgorithm::P256Ecdsa, _) => current.protocol_public_key.as_slice(),
            (_, Some(legacy)) => legacy.as_slice(),
            _ => {
                return Err(IdentityError::MigrationRejected(
                    "no pinned P-256 key to migrate from".into(),
                ))
            }
        };
        if pinned_old != request.old_p256_public_key.as_slice() {
            return Err(IdentityError::MigrationRejected(
                "presented old key does not match the pinned key".into(),
            ));
        }

        verify_signature(
            SignatureAlgorithm::P256Ecdsa,
            &request.old_p256_public_key,
            &KeyUpgradeRequest::old_over_new_preimage(&request.new_ed25519_public_key),
            &request.sig_old_over_new,
        )
        .map_err(|_| IdentityError::MigrationRejected("old-over-new signature invalid".into()))?;

        verify_signature(
            SignatureAlgorithm::Ed25519,
            &request.new_ed25519_public_key,
            &KeyUpgradeRequest::new_over_old_preimage(&request.old_p256_public_key),
            &request.sig_new_over_old,
        )
        .map_err(|_| IdentityError::MigrationRejected("new-over-old signature invalid".into()))?;

        let mut upgraded = (*current).clone();
        upgraded.protocol_public_key = request.new_ed25519_public_key.clone();
        upgraded.pub_key_fingerprint = fingerprint(&request.new_ed25519_public_key);
        upgraded.signature_algorithm = SignatureAlgorithm::Ed25519;
        upgraded.legacy_p256_public_key = Some(request.old_p256_public_key.clone());
        upgraded.updated_at = Utc::now();

        self.upsert(upgraded).await?;
        self.events.emit(SecurityEvent::KeyMigrationCompleted {
            from_tag: SignatureAlgorithm::P256Ecdsa.name().to_string(),
            to_tag: SignatureAlgorithm::Ed25519.name().to_string(),
            key_type: "protocol_signing".to_string(),
        });

        Ok(self
            .record(device_id)
            .await?
            .expect("record was just written"))
    }

    /// Notes that a peer authenticated through the legacy P-256 path while a
    /// modern key is pinned.
    pub fn note_legacy_signature_accepted(&self, record: &TrustRecord) {
        self.events.emit(SecurityEvent::LegacySignatureAccepted {
            expected_algorithm: record.signature_algorithm.name().to_string(),
            actual_algorithm: SignatureAlgorithm::P256Ecdsa.name().to_string(),
            device_id: record.device_id.anonymized(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use skybridge_core::MemoryEventSink;
    use skybridge_crypto::sign::{generate_signing_keypair, SoftwareP256Signer};
    use skybridge_crypto::KeyHandle;

    fn store() -> (TrustStore, Arc<MemoryEventSink>) {
        let events = MemoryEventSink::new();
        (
            TrustStore::new(Arc::new(MemoryStorage::new()), events.clone()),
            events,
        )
    }

    fn upgrade_fixture() -> (TrustRecord, KeyUpgradeRequest) {
        let old = SoftwareP256Signer::generate();
        let (new_public, new_secret) =
            generate_signing_keypair(SignatureAlgorithm::Ed25519).unwrap();
        let new_signer = skybridge_crypto::protocol_signer_from_handle(
            SignatureAlgorithm::Ed25519,
            &new_public,
            &KeyHandle::software(new_secret),
        )
        .unwrap();

        let record = TrustRecord::new(
            DeviceId::new("peer-device"),
            old.public_key(),
            SignatureAlgorithm::P256Ecdsa,
        );

        let request = KeyUpgradeRequest {
            old_p256_public_key: old.public_key(),
            new_ed25519_public_key: new_public.clone(),
            sig_old_over_new: old
                .sign(&KeyUpgradeRequest::old_over_new_preimage(&new_public))
                .unwrap(),
            sig_new_over_old: new_signer
                .sign(&KeyUpgradeRequest::new_over_old_preimage(&old.public_key()))
                .unwrap(),
        };
        (record, request)
    }

    #[tokio::test]
    async fn records_roundtrip_through_storage() {
        let (store, _) = store();
        let mut record = TrustRecord::new(
            DeviceId::new("peer-1"),
            vec![0xAA; 32],
            SignatureAlgorithm::Ed25519,
        );
        record.set_kem_public_key(CipherSuite::MlKem768MlDsa65, vec![0xBB; 1184]);
        store.upsert(record.clone()).await.unwrap();

        let loaded = store.record(&DeviceId::new("peer-1")).await.unwrap().unwrap();
        assert_eq!(loaded.pub_key_fingerprint, fingerprint(&[0xAA; 32]));
        assert_eq!(
            loaded.kem_public_key(CipherSuite::MlKem768MlDsa65).unwrap().len(),
            1184
        );
        assert!(store.record(&DeviceId::new("peer-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_upgrade_accepts_valid_dual_signature() {
        let (store, events) = store();
        let (record, request) = upgrade_fixture();
        let device_id = record.device_id.clone();
        store.upsert(record).await.unwrap();

        let upgraded = store.apply_key_upgrade(&device_id, &request).await.unwrap();
        assert_eq!(upgraded.signature_algorithm, SignatureAlgorithm::Ed25519);
        assert_eq!(
            upgraded.pub_key_fingerprint,
            fingerprint(&request.new_ed25519_public_key)
        );
        assert_eq!(
            upgraded.legacy_p256_public_key.as_deref(),
            Some(request.old_p256_public_key.as_slice())
        );
        assert_eq!(events.named("key_migration_completed").len(), 1);
    }

    #[tokio::test]
    async fn key_upgrade_rejects_flipped_signatures() {
        for flip_old in [true, false] {
            let (store, events) = store();
            let (record, mut request) = upgrade_fixture();
            let device_id = record.device_id.clone();
            store.upsert(record).await.unwrap();

            if flip_old {
                request.sig_old_over_new[0] ^= 0x01;
            } else {
                request.sig_new_over_old[0] ^= 0x01;
            }

            let result = store.apply_key_upgrade(&device_id, &request).await;
            assert!(matches!(result, Err(IdentityError::MigrationRejected(_))));
            assert!(events.named("key_migration_completed").is_empty());

            // The record is untouched.
            let record = store.record(&device_id).await.unwrap().unwrap();
            assert_eq!(record.signature_algorithm, SignatureAlgorithm::P256Ecdsa);
        }
    }

    #[tokio::test]
    async fn key_upgrade_requires_matching_pinned_key() {
        let (store, _) = store();
        let (_, request) = upgrade_fixture();

        // Record pins a different P-256 key.
        let other = SoftwareP256Signer::generate();
        let record = TrustRecord::new(
            DeviceId::new("peer-device"),
            other.public_key(),
            SignatureAlgorithm::P256Ecdsa,
        );
        let device_id = record.device_id.clone();
        store.upsert(record).await.unwrap();

        assert!(matches!(
            store.apply_key_upgrade(&device_id, &request).await,
            Err(IdentityError::MigrationRejected(_))
        ));
    }

    #[tokio::test]
    async fn legacy_acceptance_emits_event() {
        let (store, events) = store();
        let record = TrustRecord::new(
            DeviceId::new("legacy-peer"),
            vec![1u8; 32],
            SignatureAlgorithm::Ed25519,
        );
        store.note_legacy_signature_accepted(&record);
        let emitted = events.named("legacy_signature_accepted");
        assert_eq!(emitted.len(), 1);
    }
}
