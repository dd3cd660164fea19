//! The identity key manager: long-term protocol signing keys, per-suite KEM
//! identity keys and the Secure-Enclave PoP key.
//!
//! One manager instance exists per process; operations are serialized behind
//! a single async lock, and every key class is cached after first load.

use crate::error::{IdentityError, Result};
use crate::storage::{serde_hex, SecureStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skybridge_core::{EventSink, SecurityEvent};
use skybridge_crypto::keys::{kem_public_key_lengths, kem_secret_key_lengths};
use skybridge_crypto::sign::{generate_signing_keypair, SoftwareP256Signer};
use skybridge_crypto::{
    CipherSuite, CryptoProvider, KemKeypair, KeyHandle, ProviderRegistry, SignatureAlgorithm,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

const SIGNING_KEY_PREFIX: &str = "identity/signing/";
const KEM_KEY_PREFIX: &str = "identity/kem/";
const SE_POP_KEY: &str = "identity/se-pop";
const DEVICE_ID_KEY: &str = "identity/device-id";

/// How Secure-Enclave PoP keys are provisioned on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureEnclaveMode {
    /// No enclave (or entitlement missing); PoP is disabled gracefully.
    Unavailable,

    /// Software-backed P-256 PoP key kept in secure storage. Used on
    /// platforms without an enclave and by tests.
    SoftwareBacked,
}

/// A usable Secure-Enclave PoP key.
#[derive(Clone)]
pub struct SePop {
    /// Uncompressed SEC1 public key.
    pub public_key: Vec<u8>,

    secret: Zeroizing<Vec<u8>>,
}

impl SePop {
    /// Signs a PoP preimage with the P-256 key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signer = SoftwareP256Signer::from_secret_bytes(&self.secret)?;
        Ok(signer.sign(message)?)
    }

    /// Key handle describing this key for driver validation.
    pub fn handle(&self) -> KeyHandle {
        KeyHandle::software(self.secret.to_vec())
    }
}

impl std::fmt::Debug for SePop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SePop")
            .field("public_key_len", &self.public_key.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct SigningRecord {
    algorithm: String,
    #[serde(with = "serde_hex")]
    public_key: Vec<u8>,
    #[serde(with = "serde_hex")]
    secret_key: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct KemRecord {
    suite_wire_id: u16,
    #[serde(default)]
    tier: Option<String>,
    #[serde(with = "serde_hex")]
    public_key: Vec<u8>,
    #[serde(with = "serde_hex")]
    secret_key: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default)]
struct SePopRecord {
    #[serde(default, with = "serde_hex::option")]
    public_key: Option<Vec<u8>>,
    #[serde(default, with = "serde_hex::option")]
    secret_key: Option<Vec<u8>>,
}

#[derive(Default)]
struct ManagerState {
    signing: HashMap<SignatureAlgorithm, (Vec<u8>, KeyHandle)>,
    kem: HashMap<CipherSuite, KemKeypair>,
    se_pop: Option<Option<SePop>>,
}

/// Manages the three long-term key purposes in secure storage.
pub struct IdentityKeyManager {
    storage: Arc<dyn SecureStorage>,
    registry: ProviderRegistry,
    events: Arc<dyn EventSink>,
    se_mode: SecureEnclaveMode,
    state: Mutex<ManagerState>,
}

impl IdentityKeyManager {
    /// Creates a manager over the given storage and providers.
    pub fn new(
        storage: Arc<dyn SecureStorage>,
        registry: ProviderRegistry,
        events: Arc<dyn EventSink>,
        se_mode: SecureEnclaveMode,
    ) -> Self {
        Self {
            storage,
            registry,
            events,
            se_mode,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Stable local device id, created on first use.
    pub async fn device_id(&self) -> Result<skybridge_core::DeviceId> {
        if let Some(bytes) = self.storage.get(DEVICE_ID_KEY).await? {
            let id = String::from_utf8(bytes)
                .map_err(|_| IdentityError::Serialization("device id is not UTF-8".into()))?;
            return Ok(skybridge_core::DeviceId::new(id));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.storage
            .put(DEVICE_ID_KEY, id.clone().into_bytes())
            .await?;
        Ok(skybridge_core::DeviceId::new(id))
    }

    /// Loads or lazily creates the protocol signing key for `algorithm`.
    ///
    /// Ed25519 and ML-DSA-65 keys coexist; the two-attempt strategy picks
    /// which one a given handshake uses.
    pub async fn get_or_create_protocol_signing_key(
        &self,
        algorithm: SignatureAlgorithm,
    ) -> Result<(Vec<u8>, KeyHandle)> {
        if !algorithm.is_protocol_signing() {
            return Err(skybridge_crypto::CryptoError::InvalidAlgorithmForProtocolSigning(
                algorithm,
            )
            .into());
        }

        let mut state = self.state.lock().await;
        if let Some(cached) = state.signing.get(&algorithm) {
            return Ok(cached.clone());
        }

        let key = format!("{SIGNING_KEY_PREFIX}{}", algorithm.name());
        let entry = match self.storage.get(&key).await? {
            Some(bytes) => {
                let record: SigningRecord = serde_json::from_slice(&bytes)?;
                let handle = KeyHandle::software(record.secret_key);
                handle.validate_for(algorithm)?;
                (record.public_key, handle)
            }
            None => {
                let (public_key, secret_key) = generate_signing_keypair(algorithm)?;
                let record = SigningRecord {
                    algorithm: algorithm.name().to_string(),
                    public_key: public_key.clone(),
                    secret_key: secret_key.clone(),
                    created_at: Utc::now(),
                };
                self.storage.put(&key, serde_json::to_vec(&record)?).await?;
                tracing::info!(algorithm = algorithm.name(), "created protocol signing key");
                (public_key, KeyHandle::software(secret_key))
            }
        };

        state.signing.insert(algorithm, entry.clone());
        Ok(entry)
    }

    /// Replaces the protocol signing key for `algorithm` with a fresh one.
    pub async fn rotate_protocol_signing_key(
        &self,
        algorithm: SignatureAlgorithm,
    ) -> Result<(Vec<u8>, KeyHandle)> {
        if !algorithm.is_protocol_signing() {
            return Err(skybridge_crypto::CryptoError::InvalidAlgorithmForProtocolSigning(
                algorithm,
            )
            .into());
        }

        let mut state = self.state.lock().await;
        let (public_key, secret_key) = generate_signing_keypair(algorithm)?;
        let record = SigningRecord {
            algorithm: algorithm.name().to_string(),
            public_key: public_key.clone(),
            secret_key: secret_key.clone(),
            created_at: Utc::now(),
        };
        let key = format!("{SIGNING_KEY_PREFIX}{}", algorithm.name());
        self.storage.put(&key, serde_json::to_vec(&record)?).await?;
        tracing::info!(algorithm = algorithm.name(), "rotated protocol signing key");

        let entry = (public_key, KeyHandle::software(secret_key));
        state.signing.insert(algorithm, entry.clone());
        Ok(entry)
    }

    /// Loads or creates the KEM identity keypair for a suite.
    ///
    /// Records are tagged with the provider tier; untagged records written by
    /// older builds are migrated in place when their lengths match the
    /// current provider.
    pub async fn kem_identity_keypair(&self, suite: CipherSuite) -> Result<KemKeypair> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.kem.get(&suite) {
            return Ok(cached.clone());
        }

        let provider = self.registry.provider_for_suite(suite)?;
        let tagged_key = Self::kem_record_key(suite, Some(provider.as_ref()));
        let legacy_key = Self::kem_record_key(suite, None);

        let keypair = if let Some(bytes) = self.storage.get(&tagged_key).await? {
            let record: KemRecord = serde_json::from_slice(&bytes)?;
            Self::keypair_from_record(suite, record)?
        } else if let Some(bytes) = self.storage.get(&legacy_key).await? {
            // Pre-tier record: adopt it when the material fits the current
            // provider, otherwise leave it behind and start fresh.
            let record: KemRecord = serde_json::from_slice(&bytes)?;
            match Self::keypair_from_record(suite, record) {
                Ok(keypair) => {
                    let migrated = KemRecord {
                        suite_wire_id: suite.wire_id(),
                        tier: Some(provider.tier().to_string()),
                        public_key: keypair.public_key.clone(),
                        secret_key: keypair.secret_key.to_vec(),
                        created_at: Utc::now(),
                    };
                    self.storage
                        .put(&tagged_key, serde_json::to_vec(&migrated)?)
                        .await?;
                    self.storage.delete(&legacy_key).await?;
                    tracing::info!(suite = suite.name(), "migrated pre-tier KEM identity record");
                    keypair
                }
                Err(_) => self.create_kem_keypair(suite, &tagged_key, provider.as_ref()).await?,
            }
        } else {
            self.create_kem_keypair(suite, &tagged_key, provider.as_ref()).await?
        };

        state.kem.insert(suite, keypair.clone());
        Ok(keypair)
    }

    /// Public half of the KEM identity key for a suite.
    pub async fn kem_identity_public_key(&self, suite: CipherSuite) -> Result<Vec<u8>> {
        Ok(self.kem_identity_keypair(suite).await?.public_key)
    }

    /// The Secure-Enclave PoP key, when the platform provides one.
    ///
    /// Returns `Ok(None)` when PoP is unavailable or its stored state is
    /// inconsistent; the caller decides whether policy makes that fatal.
    pub async fn se_pop(&self) -> Result<Option<SePop>> {
        let mut state = self.state.lock().await;
        if let Some(cached) = &state.se_pop {
            return Ok(cached.clone());
        }

        let resolved = match self.se_mode {
            SecureEnclaveMode::Unavailable => None,
            SecureEnclaveMode::SoftwareBacked => match self.storage.get(SE_POP_KEY).await? {
                Some(bytes) => {
                    let record: SePopRecord = serde_json::from_slice(&bytes)?;
                    match (record.public_key, record.secret_key) {
                        (Some(public_key), Some(secret)) if !secret.is_empty() => Some(SePop {
                            public_key,
                            secret: Zeroizing::new(secret),
                        }),
                        (Some(_), _) => {
                            self.events.emit(SecurityEvent::SePopInconsistentState {
                                state: "public_key_without_signing_handle".into(),
                            });
                            None
                        }
                        (None, Some(_)) => {
                            self.events.emit(SecurityEvent::SePopInconsistentState {
                                state: "signing_handle_without_public_key".into(),
                            });
                            None
                        }
                        (None, None) => None,
                    }
                }
                None => {
                    let signer = SoftwareP256Signer::generate();
                    let record = SePopRecord {
                        public_key: Some(signer.public_key()),
                        secret_key: Some(signer.secret_bytes()),
                    };
                    self.storage
                        .put(SE_POP_KEY, serde_json::to_vec(&record)?)
                        .await?;
                    tracing::info!("created software-backed SE-PoP key");
                    Some(SePop {
                        public_key: signer.public_key(),
                        secret: Zeroizing::new(signer.secret_bytes()),
                    })
                }
            },
        };

        state.se_pop = Some(resolved.clone());
        Ok(resolved)
    }

    async fn create_kem_keypair(
        &self,
        suite: CipherSuite,
        tagged_key: &str,
        provider: &dyn CryptoProvider,
    ) -> Result<KemKeypair> {
        let keypair = provider.kem_generate_keypair(suite)?;
        let record = KemRecord {
            suite_wire_id: suite.wire_id(),
            tier: Some(provider.tier().to_string()),
            public_key: keypair.public_key.clone(),
            secret_key: keypair.secret_key.to_vec(),
            created_at: Utc::now(),
        };
        self.storage
            .put(tagged_key, serde_json::to_vec(&record)?)
            .await?;
        tracing::info!(suite = suite.name(), "created KEM identity keypair");
        Ok(keypair)
    }

    fn kem_record_key(suite: CipherSuite, provider: Option<&dyn CryptoProvider>) -> String {
        match provider {
            Some(provider) => format!(
                "{KEM_KEY_PREFIX}{:04x}/{}",
                suite.wire_id(),
                provider.tier()
            ),
            None => format!("{KEM_KEY_PREFIX}{:04x}", suite.wire_id()),
        }
    }

    fn keypair_from_record(suite: CipherSuite, record: KemRecord) -> Result<KemKeypair> {
        if !kem_public_key_lengths(suite).contains(&record.public_key.len()) {
            return Err(IdentityError::KeyLength {
                context: format!("kem public key for {suite}"),
                actual: record.public_key.len(),
            });
        }
        if !kem_secret_key_lengths(suite).contains(&record.secret_key.len()) {
            return Err(IdentityError::KeyLength {
                context: format!("kem secret key for {suite}"),
                actual: record.secret_key.len(),
            });
        }
        Ok(KemKeypair {
            suite,
            public_key: record.public_key,
            secret_key: Zeroizing::new(record.secret_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use skybridge_core::MemoryEventSink;

    fn manager(storage: Arc<dyn SecureStorage>) -> (IdentityKeyManager, Arc<MemoryEventSink>) {
        let events = MemoryEventSink::new();
        let manager = IdentityKeyManager::new(
            storage,
            ProviderRegistry::full(),
            events.clone(),
            SecureEnclaveMode::SoftwareBacked,
        );
        (manager, events)
    }

    #[tokio::test]
    async fn signing_keys_persist_across_instances() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let (first, _) = manager(storage.clone());
        let (public_a, _) = first
            .get_or_create_protocol_signing_key(SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        let (second, _) = manager(storage);
        let (public_b, _) = second
            .get_or_create_protocol_signing_key(SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        assert_eq!(public_a, public_b);
    }

    #[tokio::test]
    async fn both_signing_algorithms_coexist() {
        let (manager, _) = manager(Arc::new(MemoryStorage::new()));
        let (ed_public, _) = manager
            .get_or_create_protocol_signing_key(SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        let (mldsa_public, _) = manager
            .get_or_create_protocol_signing_key(SignatureAlgorithm::MlDsa65)
            .await
            .unwrap();
        assert_eq!(ed_public.len(), 32);
        assert_eq!(mldsa_public.len(), 1952);
    }

    #[tokio::test]
    async fn p256_is_rejected_for_protocol_signing() {
        let (manager, _) = manager(Arc::new(MemoryStorage::new()));
        assert!(manager
            .get_or_create_protocol_signing_key(SignatureAlgorithm::P256Ecdsa)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rotation_changes_the_key() {
        let (manager, _) = manager(Arc::new(MemoryStorage::new()));
        let (before, _) = manager
            .get_or_create_protocol_signing_key(SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        let (after, _) = manager
            .rotate_protocol_signing_key(SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        assert_ne!(before, after);

        let (loaded, _) = manager
            .get_or_create_protocol_signing_key(SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        assert_eq!(loaded, after);
    }

    #[tokio::test]
    async fn kem_identity_keys_are_stable_per_suite() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let (manager_a, _) = manager(storage.clone());
        let pk_a = manager_a
            .kem_identity_public_key(CipherSuite::MlKem768MlDsa65)
            .await
            .unwrap();
        assert_eq!(pk_a.len(), 1184);

        let (manager_b, _) = manager(storage);
        let pk_b = manager_b
            .kem_identity_public_key(CipherSuite::MlKem768MlDsa65)
            .await
            .unwrap();
        assert_eq!(pk_a, pk_b);
    }

    #[tokio::test]
    async fn pre_tier_kem_record_is_migrated() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let (seed_manager, _) = manager(storage.clone());
        let keypair = seed_manager
            .kem_identity_keypair(CipherSuite::MlKem768MlDsa65)
            .await
            .unwrap();

        // Rewrite the record the way a pre-tier build stored it.
        let legacy = KemRecord {
            suite_wire_id: CipherSuite::MlKem768MlDsa65.wire_id(),
            tier: None,
            public_key: keypair.public_key.clone(),
            secret_key: keypair.secret_key.to_vec(),
            created_at: Utc::now(),
        };
        storage
            .put("identity/kem/0101", serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();
        storage.delete("identity/kem/0101/pqc").await.unwrap();

        let (fresh_manager, _) = manager(storage.clone());
        let migrated = fresh_manager
            .kem_identity_keypair(CipherSuite::MlKem768MlDsa65)
            .await
            .unwrap();
        assert_eq!(migrated.public_key, keypair.public_key);
        assert!(storage.get("identity/kem/0101").await.unwrap().is_none());
        assert!(storage.get("identity/kem/0101/pqc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn se_pop_pair_invariant_is_enforced() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let record = SePopRecord {
            public_key: Some(vec![4u8; 65]),
            secret_key: None,
        };
        storage
            .put(SE_POP_KEY, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let (manager, events) = manager(storage);
        assert!(manager.se_pop().await.unwrap().is_none());
        assert_eq!(events.named("sePoP_inconsistent_state_detected").len(), 1);
    }

    #[tokio::test]
    async fn se_pop_unavailable_mode_returns_none() {
        let manager = IdentityKeyManager::new(
            Arc::new(MemoryStorage::new()),
            ProviderRegistry::full(),
            MemoryEventSink::new(),
            SecureEnclaveMode::Unavailable,
        );
        assert!(manager.se_pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn se_pop_signs_verifiable_pop() {
        let (manager, _) = manager(Arc::new(MemoryStorage::new()));
        let pop = manager.se_pop().await.unwrap().unwrap();
        let signature = pop.sign(b"pop-binding").unwrap();
        skybridge_crypto::verify_signature(
            SignatureAlgorithm::P256Ecdsa,
            &pop.public_key,
            b"pop-binding",
            &signature,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn device_id_is_stable() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let (manager_a, _) = manager(storage.clone());
        let id_a = manager_a.device_id().await.unwrap();
        let (manager_b, _) = manager(storage);
        assert_eq!(id_a, manager_b.device_id().await.unwrap());
    }
}
