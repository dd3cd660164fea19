//! The per-session crypto core.
//!
//! A `HandshakeContext` is created when a handshake starts, used exactly
//! once, and zeroized on completion, failure, timeout or cancellation. It
//! owns every per-session secret: ephemeral KEM keys, cached KEM shared
//! secrets, nonces and transcript hashes.

use crate::config::HandshakeConfig;
use crate::error::{HandshakeError, Result};
use crate::keyschedule::{derive_session_keys, SessionKeys};
use crate::messages::{
    HandshakeMessageA, HandshakeMessageB, KeyShare, WireIdentityKey, NONCE_BYTES,
};
use crate::negotiation::{
    check_suite_signature_compatibility, select_suite, signature_algorithm_for_offer,
    OfferedSuites,
};
use crate::pinning::IdentityValidator;
use crate::replay::{handshake_id, ReplayCache, REPLAY_TAG_MESSAGE_A, REPLAY_TAG_MESSAGE_B};
use crate::transcript::{TranscriptBuilder, TranscriptVersion};
use rand::RngCore;
use skybridge_core::{
    CryptoPolicy, DeviceId, EventSink, HandshakePolicy, Role, SecurityEvent,
};
use skybridge_crypto::aead::{open_with_secret, seal_with_secret};
use skybridge_crypto::keys::SharedSecret;
use skybridge_crypto::sign::protocol_signer_from_handle;
use skybridge_crypto::{
    verify_signature, CipherSuite, CryptoCapabilities, KemKeypair, ProtocolSigner,
    ProviderRegistry, SignatureAlgorithm,
};
use skybridge_identity::{IdentityKeyManager, SePop, TrustRecordUpdate};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroize;

/// HKDF info label for the MessageB sealed payload.
const HANDSHAKE_PAYLOAD_INFO: &[u8] = b"handshake-payload";

/// Everything a context needs at construction.
pub struct ContextParams {
    /// Role this side plays.
    pub role: Role,

    /// Cipher-suite providers.
    pub registry: ProviderRegistry,

    /// Long-term key manager.
    pub identity: Arc<IdentityKeyManager>,

    /// Policy bound into MessageA and the transcript.
    pub policy: HandshakePolicy,

    /// Local-only crypto preferences.
    pub crypto_policy: CryptoPolicy,

    /// Capabilities advertised to the peer.
    pub local_capabilities: CryptoCapabilities,

    /// Driver configuration (transcript versions).
    pub config: HandshakeConfig,

    /// Security-event sink.
    pub events: Arc<dyn EventSink>,

    /// Trusted peer KEM identity keys by suite (from the trust store).
    pub trusted_peer_kem_keys: HashMap<CipherSuite, Vec<u8>>,

    /// Pinned peer SE-PoP public key, if any.
    pub trusted_peer_se_key: Option<Vec<u8>>,
}

/// Per-session cryptographic state. Single use; zeroized at the end of every
/// path.
pub struct HandshakeContext {
    role: Role,
    registry: ProviderRegistry,
    identity: Arc<IdentityKeyManager>,
    policy: HandshakePolicy,
    crypto_policy: CryptoPolicy,
    local_capabilities: CryptoCapabilities,
    supported_versions: Vec<TranscriptVersion>,
    events: Arc<dyn EventSink>,
    trusted_peer_kem_keys: HashMap<CipherSuite, Vec<u8>>,
    trusted_peer_se_key: Option<Vec<u8>>,

    signer: Option<Box<dyn ProtocolSigner>>,
    sig_algorithm: Option<SignatureAlgorithm>,
    se_pop: Option<SePop>,

    negotiated_version: Option<TranscriptVersion>,
    own_nonce: Option<[u8; NONCE_BYTES]>,
    peer_nonce: Option<[u8; NONCE_BYTES]>,
    ephemeral_keys: HashMap<CipherSuite, KemKeypair>,
    kem_shared_secrets: HashMap<CipherSuite, SharedSecret>,
    offered: Vec<CipherSuite>,
    hybrid_offered_with_peer_key: bool,
    selected_peer_share: Option<Vec<u8>>,
    peer_capabilities: Option<CryptoCapabilities>,
    negotiated_suite: Option<CipherSuite>,
    message_a: Option<HandshakeMessageA>,
    transcript_a: Option<[u8; 32]>,
    transcript_b: Option<[u8; 32]>,
    recommended_trust_update: Option<TrustRecordUpdate>,
    zeroized: bool,
}

impl HandshakeContext {
    /// Creates a responder context. The signer is resolved after suite
    /// selection, since its algorithm depends on the selected family.
    pub fn responder(params: ContextParams) -> Self {
        Self::new(params, None, None)
    }

    /// Creates an initiator context with the signer the offer requires.
    pub fn initiator(
        params: ContextParams,
        signer: Box<dyn ProtocolSigner>,
        se_pop: Option<SePop>,
    ) -> Self {
        let algorithm = signer.algorithm();
        let mut context = Self::new(params, Some(signer), se_pop);
        context.sig_algorithm = Some(algorithm);
        context
    }

    fn new(
        params: ContextParams,
        signer: Option<Box<dyn ProtocolSigner>>,
        se_pop: Option<SePop>,
    ) -> Self {
        Self {
            role: params.role,
            registry: params.registry,
            identity: params.identity,
            policy: params.policy,
            crypto_policy: params.crypto_policy,
            local_capabilities: params.local_capabilities,
            supported_versions: params.config.transcript_versions.clone(),
            events: params.events,
            trusted_peer_kem_keys: params.trusted_peer_kem_keys,
            trusted_peer_se_key: params.trusted_peer_se_key,
            signer,
            sig_algorithm: None,
            se_pop,
            negotiated_version: None,
            own_nonce: None,
            peer_nonce: None,
            ephemeral_keys: HashMap::new(),
            kem_shared_secrets: HashMap::new(),
            offered: Vec::new(),
            hybrid_offered_with_peer_key: false,
            selected_peer_share: None,
            peer_capabilities: None,
            negotiated_suite: None,
            message_a: None,
            transcript_a: None,
            transcript_b: None,
            recommended_trust_update: None,
            zeroized: false,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.zeroized {
            Err(HandshakeError::ContextZeroized)
        } else {
            Ok(())
        }
    }

    /// The handshake policy this context runs under.
    pub fn policy(&self) -> &HandshakePolicy {
        &self.policy
    }

    /// The negotiated suite, once one exists.
    pub fn negotiated_suite(&self) -> Option<CipherSuite> {
        self.negotiated_suite
    }

    /// Algorithm of the configured signer, when one is present.
    pub fn signer_algorithm(&self) -> Option<SignatureAlgorithm> {
        self.signer.as_ref().map(|signer| signer.algorithm())
    }

    /// The trust-record recommendation produced by first-contact pinning.
    pub fn recommended_trust_update(&self) -> Option<&TrustRecordUpdate> {
        self.recommended_trust_update.as_ref()
    }

    /// Takes the first-contact recommendation out of the context, so the
    /// driver can surface it past zeroization.
    pub fn take_recommended_trust_update(&mut self) -> Option<TrustRecordUpdate> {
        self.recommended_trust_update.take()
    }

    fn announced_version(&self) -> TranscriptVersion {
        self.supported_versions
            .iter()
            .copied()
            .max()
            .unwrap_or(TranscriptVersion::V1)
    }

    fn fresh_nonce() -> [u8; NONCE_BYTES] {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        nonce
    }

    fn transcript_a_hash(
        &self,
        version: TranscriptVersion,
        message: &HandshakeMessageA,
    ) -> [u8; 32] {
        TranscriptBuilder::new()
            .protocol_version(message.version as u32)
            .role(Role::Initiator)
            .signature_algorithm(message.identity_key.algorithm)
            .policy(message.policy)
            .local_capabilities(message.capabilities.deterministic_bytes())
            .initiator_public_key(message.identity_key.public_key.clone())
            .initiator_nonce(message.client_nonce)
            .message_a(message.encode())
            .hash(version)
    }

    fn transcript_b_hash(
        &self,
        version: TranscriptVersion,
        message: &HandshakeMessageB,
    ) -> [u8; 32] {
        TranscriptBuilder::new()
            .protocol_version(message.version as u32)
            .role(Role::Responder)
            .suite(message.selected_suite)
            .responder_public_key(message.identity_key.public_key.clone())
            .responder_nonce(message.server_nonce)
            .message_b(message.encode())
            .hash(version)
    }

    /// Builds MessageA (initiator).
    ///
    /// Resolves the offer against policy and available peer KEM keys,
    /// generates shares, signs, and fixes transcriptA.
    pub fn build_message_a(&mut self, offered: &OfferedSuites) -> Result<HandshakeMessageA> {
        self.ensure_active()?;
        debug_assert_eq!(self.role, Role::Initiator);

        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| HandshakeError::InvalidProviderType("initiator has no signer".into()))?;

        let mut suites = Vec::new();
        let mut key_shares = Vec::new();
        for &suite in &offered.suites {
            if suite.tier() < self.policy.minimum_tier
                || suite.tier() < self.crypto_policy.minimum_security_tier
            {
                continue;
            }
            if suite.is_hybrid()
                && !(self.crypto_policy.advertise_hybrid
                    && self.crypto_policy.allow_experimental_hybrid)
            {
                continue;
            }

            if suite.is_pqc_group() {
                // A PQC share is an encapsulation to the peer's KEM identity
                // key; without a trusted key the suite cannot be offered.
                let Some(peer_key) = self.trusted_peer_kem_keys.get(&suite) else {
                    continue;
                };
                let provider = self.registry.provider_for_suite(suite)?;
                let (encapsulated, shared_secret) = provider.kem_encapsulate(suite, peer_key)?;
                self.kem_shared_secrets.insert(suite, shared_secret);
                key_shares.push(KeyShare {
                    suite,
                    share: encapsulated,
                });
                if suite.is_hybrid() {
                    self.hybrid_offered_with_peer_key = true;
                }
            } else {
                let provider = self.registry.provider_for_suite(suite)?;
                let keypair = provider.kem_generate_keypair(suite)?;
                key_shares.push(KeyShare {
                    suite,
                    share: keypair.public_key.clone(),
                });
                self.ephemeral_keys.insert(suite, keypair);
            }
            suites.push(suite);
        }

        if suites.is_empty() {
            return Err(HandshakeError::SuiteNegotiationFailed(
                "no offerable suites remain after policy filtering".into(),
            ));
        }

        let sig_algorithm = signature_algorithm_for_offer(&suites)?;
        if sig_algorithm != signer.algorithm() {
            return Err(HandshakeError::ProviderAlgorithmMismatch {
                expected: sig_algorithm,
                actual: signer.algorithm(),
            });
        }

        if self.policy.require_secure_enclave_pop && self.se_pop.is_none() {
            return Err(HandshakeError::SecureEnclavePopRequired);
        }

        let client_nonce = Self::fresh_nonce();
        let version = self.announced_version();

        let mut message = HandshakeMessageA {
            version: version.wire_code(),
            supported_suites: suites.clone(),
            key_shares,
            client_nonce,
            policy: self.policy,
            capabilities: self.local_capabilities.clone(),
            identity_key: WireIdentityKey {
                algorithm: sig_algorithm,
                public_key: signer.public_key(),
                se_pop_public_key: self.se_pop.as_ref().map(|pop| pop.public_key.clone()),
            },
            signature: Vec::new(),
            se_signature: None,
        };

        message.signature = signer.sign(&message.signature_preimage())?;
        if let Some(pop) = &self.se_pop {
            match pop.sign(&message.se_signature_preimage()) {
                Ok(signature) => message.se_signature = Some(signature),
                Err(_) if self.policy.require_secure_enclave_pop => {
                    return Err(HandshakeError::SecureEnclavePopRequired);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "SE-PoP signing failed; continuing without");
                }
            }
        }

        self.own_nonce = Some(client_nonce);
        self.offered = suites;
        self.sig_algorithm = Some(sig_algorithm);
        self.negotiated_version = Some(version);
        self.transcript_a = Some(self.transcript_a_hash(version, &message));
        self.message_a = Some(message.clone());

        Ok(message)
    }

    /// Processes MessageA (responder): verifies, selects a suite, binds the
    /// shared secret for the PQC path, registers replay, fixes transcriptA.
    pub async fn process_message_a(
        &mut self,
        message: &HandshakeMessageA,
        validator: &dyn IdentityValidator,
        replay: &ReplayCache,
        peer: &DeviceId,
    ) -> Result<()> {
        self.ensure_active()?;
        debug_assert_eq!(self.role, Role::Responder);

        let version = TranscriptVersion::negotiate(&self.supported_versions, message.version)?;

        let sig_algorithm = signature_algorithm_for_offer(&message.supported_suites)?;
        if message.identity_key.algorithm != sig_algorithm {
            return Err(HandshakeError::SignatureAlgorithmMismatch {
                expected: sig_algorithm,
                actual: message.identity_key.algorithm,
            });
        }

        verify_signature(
            sig_algorithm,
            &message.identity_key.public_key,
            &message.signature_preimage(),
            &message.signature,
        )
        .map_err(|_| HandshakeError::SignatureVerificationFailed)?;

        self.recommended_trust_update = validator.validate(peer, &message.identity_key).await?;
        self.verify_se_signature(
            &message.se_signature,
            &message.se_signature_preimage(),
        )?;

        let local_floor = self
            .policy
            .minimum_tier
            .max(self.crypto_policy.minimum_security_tier);
        let selected = select_suite(
            &message.supported_suites,
            sig_algorithm,
            &self.registry,
            &message.policy,
            local_floor,
        )?;
        if self.policy.require_pqc && !selected.is_pqc() {
            return Err(HandshakeError::SuiteNegotiationFailed(
                "local policy requires a PQC suite".into(),
            ));
        }

        let share = message
            .key_shares
            .iter()
            .find(|share| share.suite == selected)
            .ok_or_else(|| {
                HandshakeError::InvalidMessageFormat(format!(
                    "no key share for selected suite {selected}"
                ))
            })?;

        if selected.is_pqc_group() {
            let keypair = self.identity.kem_identity_keypair(selected).await?;
            let provider = self.registry.provider_for_suite(selected)?;
            let shared_secret = provider.kem_decapsulate(&keypair, &share.share)?;
            self.kem_shared_secrets.insert(selected, shared_secret);
        }
        self.selected_peer_share = Some(share.share.clone());

        replay.register(handshake_id(
            REPLAY_TAG_MESSAGE_A,
            &message.client_nonce,
            None,
            selected,
        ))?;

        self.peer_nonce = Some(message.client_nonce);
        self.peer_capabilities = Some(message.capabilities.clone());
        self.offered = message.supported_suites.clone();
        self.sig_algorithm = Some(sig_algorithm);
        self.negotiated_suite = Some(selected);
        self.negotiated_version = Some(version);
        self.transcript_a = Some(self.transcript_a_hash(version, message));

        Ok(())
    }

    /// Builds MessageB (responder). Returns the message and the shared
    /// secret the session keys derive from.
    pub async fn build_message_b(&mut self) -> Result<(HandshakeMessageB, SharedSecret)> {
        self.ensure_active()?;
        debug_assert_eq!(self.role, Role::Responder);

        let suite = self
            .negotiated_suite
            .ok_or(HandshakeError::SuiteNegotiationFailed(
                "MessageB requested before suite selection".into(),
            ))?;
        let version = self.negotiated_version.expect("set with the suite");
        let transcript_a = self.transcript_a.expect("set with the suite");

        let sig_algorithm = suite.protocol_signature_algorithm();
        let (public_key, handle) = self
            .identity
            .get_or_create_protocol_signing_key(sig_algorithm)
            .await?;
        let signer = protocol_signer_from_handle(sig_algorithm, &public_key, &handle)?;

        let se_pop = self.identity.se_pop().await?;
        if self.policy.require_secure_enclave_pop && se_pop.is_none() {
            return Err(HandshakeError::SecureEnclavePopRequired);
        }

        let payload = self.local_capabilities.deterministic_bytes();
        let server_nonce = Self::fresh_nonce();

        let (sealed, responder_share, shared_secret) = if suite.is_pqc_group() {
            // The KEM share already traveled in MessageA; seal under the
            // cached secret and send no responder share.
            let shared_secret = self
                .kem_shared_secrets
                .get(&suite)
                .cloned()
                .ok_or_else(|| {
                    HandshakeError::Crypto(skybridge_crypto::CryptoError::Decapsulation(
                        "no cached KEM shared secret for the selected suite".into(),
                    ))
                })?;
            let sealed = seal_with_secret(
                &shared_secret,
                &transcript_a,
                HANDSHAKE_PAYLOAD_INFO,
                &payload,
            )?;
            (sealed, Vec::new(), shared_secret)
        } else {
            let peer_share = self.selected_peer_share.clone().ok_or_else(|| {
                HandshakeError::InvalidMessageFormat("no peer share bound for the suite".into())
            })?;
            let provider = self.registry.provider_for_suite(suite)?;
            let (sealed, shared_secret) = provider.kem_dem_seal(
                suite,
                &peer_share,
                &transcript_a,
                HANDSHAKE_PAYLOAD_INFO,
                &payload,
            )?;
            let responder_share = sealed.encapsulated_key.clone();
            (sealed, responder_share, shared_secret)
        };

        let mut message = HandshakeMessageB {
            version: version.wire_code(),
            selected_suite: suite,
            responder_share,
            server_nonce,
            encrypted_payload: sealed,
            signature: Vec::new(),
            identity_key: WireIdentityKey {
                algorithm: sig_algorithm,
                public_key: signer.public_key(),
                se_pop_public_key: se_pop.as_ref().map(|pop| pop.public_key.clone()),
            },
            se_signature: None,
        };

        message.signature = signer.sign(&message.signature_preimage(&transcript_a))?;
        if let Some(pop) = &se_pop {
            match pop.sign(&message.se_signature_preimage(&transcript_a)) {
                Ok(signature) => message.se_signature = Some(signature),
                Err(_) if self.policy.require_secure_enclave_pop => {
                    return Err(HandshakeError::SecureEnclavePopRequired);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "SE-PoP signing failed; continuing without");
                }
            }
        }

        self.own_nonce = Some(server_nonce);
        self.signer = Some(signer);
        self.se_pop = se_pop;
        self.transcript_b = Some(self.transcript_b_hash(version, &message));

        Ok((message, shared_secret))
    }

    /// Processes MessageB (initiator). Returns the derived session keys.
    pub async fn process_message_b(
        &mut self,
        message: &HandshakeMessageB,
        validator: &dyn IdentityValidator,
        replay: &ReplayCache,
        peer: &DeviceId,
    ) -> Result<SessionKeys> {
        self.ensure_active()?;
        debug_assert_eq!(self.role, Role::Initiator);

        let version = TranscriptVersion::from_wire_code(message.version)?;
        if !self.supported_versions.contains(&version) {
            return Err(HandshakeError::VersionMismatch {
                local: self.announced_version().wire_code(),
                peer: message.version,
            });
        }

        let selected = message.selected_suite;
        if self.policy.require_pqc && !selected.is_pqc() {
            return Err(HandshakeError::SuiteNegotiationFailed(
                "policy requires a PQC suite but the responder selected otherwise".into(),
            ));
        }

        let sig_algorithm = self.sig_algorithm.expect("fixed when MessageA was built");
        if let Err(err) = check_suite_signature_compatibility(selected, sig_algorithm) {
            self.events.emit(SecurityEvent::SignatureAlgorithmMismatch {
                selected_suite: selected.name().to_string(),
                sig_a_algorithm: sig_algorithm.name().to_string(),
                device_id: peer.anonymized(),
            });
            return Err(err);
        }

        if !self.offered.contains(&selected) {
            return Err(HandshakeError::SuiteNegotiationFailed(format!(
                "responder selected {selected}, which was not offered"
            )));
        }
        if selected.tier() < self.policy.minimum_tier {
            return Err(HandshakeError::SuiteNegotiationFailed(format!(
                "selected suite {selected} is below the policy tier floor"
            )));
        }

        // The negotiated version may be lower than the announced one when
        // the responder only runs an older format; transcriptA is recomputed
        // under the version actually selected.
        let transcript_a = if self.negotiated_version == Some(version) {
            self.transcript_a.expect("set when MessageA was built")
        } else {
            let message_a = self.message_a.as_ref().expect("kept from MessageA build");
            let recomputed = self.transcript_a_hash(version, message_a);
            self.negotiated_version = Some(version);
            self.transcript_a = Some(recomputed);
            recomputed
        };

        if message.identity_key.algorithm != selected.protocol_signature_algorithm() {
            return Err(HandshakeError::SignatureAlgorithmMismatch {
                expected: selected.protocol_signature_algorithm(),
                actual: message.identity_key.algorithm,
            });
        }
        verify_signature(
            message.identity_key.algorithm,
            &message.identity_key.public_key,
            &message.signature_preimage(&transcript_a),
            &message.signature,
        )
        .map_err(|_| HandshakeError::SignatureVerificationFailed)?;

        self.recommended_trust_update = validator.validate(peer, &message.identity_key).await?;
        self.verify_se_signature(
            &message.se_signature,
            &message.se_signature_preimage(&transcript_a),
        )?;

        let client_nonce = self.own_nonce.expect("set when MessageA was built");
        replay.register(handshake_id(
            REPLAY_TAG_MESSAGE_B,
            &client_nonce,
            Some(&message.server_nonce),
            selected,
        ))?;
        self.peer_nonce = Some(message.server_nonce);

        if self.crypto_policy.require_hybrid_if_available
            && self.hybrid_offered_with_peer_key
            && !selected.is_hybrid()
        {
            return Err(HandshakeError::SuiteNegotiationFailed(
                "hybrid was offered with a trusted peer key but not selected".into(),
            ));
        }

        if selected != self.offered[0] {
            self.events.emit(SecurityEvent::CryptoDowngrade {
                proposed_suite: Some(self.offered[0].name().to_string()),
                selected_suite: Some(selected.name().to_string()),
                proposed_wire_id: Some(self.offered[0].wire_id()),
                selected_wire_id: Some(selected.wire_id()),
                from_strategy: None,
                to_strategy: None,
                cooldown_seconds: None,
                cooldown_remaining_seconds: None,
                policy: self.policy,
                reason: "responder selected a lower-preference suite".into(),
            });
        }

        let (payload, shared_secret) = if selected.is_pqc_group() {
            let shared_secret = self
                .kem_shared_secrets
                .get(&selected)
                .cloned()
                .ok_or_else(|| {
                    HandshakeError::Crypto(skybridge_crypto::CryptoError::Decapsulation(
                        "no cached KEM shared secret for the selected suite".into(),
                    ))
                })?;
            if !message.responder_share.is_empty() {
                return Err(HandshakeError::InvalidMessageFormat(
                    "PQC path must carry an empty responder share".into(),
                ));
            }
            let payload = open_with_secret(
                &shared_secret,
                &transcript_a,
                HANDSHAKE_PAYLOAD_INFO,
                &message.encrypted_payload,
            )?;
            (payload, shared_secret)
        } else {
            if message.responder_share != message.encrypted_payload.encapsulated_key {
                return Err(HandshakeError::InvalidMessageFormat(
                    "responder share disagrees with the sealed payload".into(),
                ));
            }
            let keypair = self.ephemeral_keys.get(&selected).ok_or_else(|| {
                HandshakeError::Crypto(skybridge_crypto::CryptoError::Decapsulation(
                    "no ephemeral key for the selected suite".into(),
                ))
            })?;
            let provider = self.registry.provider_for_suite(selected)?;
            let (payload, shared_secret) = provider.kem_dem_open_with_secret(
                keypair,
                &message.encrypted_payload,
                &transcript_a,
                HANDSHAKE_PAYLOAD_INFO,
            )?;
            (payload, shared_secret)
        };

        self.peer_capabilities = Some(
            CryptoCapabilities::from_deterministic_bytes(&payload)
                .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?,
        );
        self.negotiated_suite = Some(selected);
        self.transcript_b = Some(self.transcript_b_hash(version, message));

        self.derive_keys(shared_secret)
    }

    /// Derives the session keys once both transcripts exist.
    pub fn derive_keys(&mut self, shared_secret: SharedSecret) -> Result<SessionKeys> {
        self.ensure_active()?;
        let suite = self
            .negotiated_suite
            .ok_or(HandshakeError::SuiteNegotiationFailed(
                "key derivation before suite selection".into(),
            ))?;
        let transcript_a = self.transcript_a.expect("transcriptA fixed earlier");
        let transcript_b = self.transcript_b.expect("transcriptB fixed earlier");
        let own_nonce = self.own_nonce.expect("own nonce set");
        let peer_nonce = self.peer_nonce.expect("peer nonce bound");

        let (client_nonce, server_nonce) = match self.role {
            Role::Initiator => (own_nonce, peer_nonce),
            Role::Responder => (peer_nonce, own_nonce),
        };

        let keys = derive_session_keys(
            self.role,
            suite,
            &shared_secret,
            &transcript_a,
            &transcript_b,
            &client_nonce,
            &server_nonce,
        )?;

        // The input secret and any cached copies are dead once the
        // directional keys exist.
        drop(shared_secret);
        self.kem_shared_secrets.clear();

        Ok(keys)
    }

    fn verify_se_signature(&self, signature: &Option<Vec<u8>>, preimage: &[u8]) -> Result<()> {
        match (&self.trusted_peer_se_key, signature) {
            (Some(pinned), Some(signature)) => verify_signature(
                SignatureAlgorithm::P256Ecdsa,
                pinned,
                preimage,
                signature,
            )
            .map_err(|_| HandshakeError::SecureEnclaveSignatureInvalid),
            (Some(_), None) | (None, _) if self.policy.require_secure_enclave_pop => {
                if signature.is_some() && self.trusted_peer_se_key.is_none() {
                    // Signature present but nothing pinned to check it
                    // against; policy demands a verified PoP.
                    Err(HandshakeError::SecureEnclavePopRequired)
                } else if signature.is_none() {
                    Err(HandshakeError::SecureEnclavePopRequired)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Wipes all secret state. Idempotent; every later operation fails with
    /// `context_zeroized`.
    pub fn zeroize(&mut self) {
        if self.zeroized {
            return;
        }
        if let Some(nonce) = self.own_nonce.as_mut() {
            nonce.zeroize();
        }
        if let Some(nonce) = self.peer_nonce.as_mut() {
            nonce.zeroize();
        }
        self.own_nonce = None;
        self.peer_nonce = None;
        self.ephemeral_keys.clear();
        self.kem_shared_secrets.clear();
        self.selected_peer_share = None;
        self.offered.clear();
        if let Some(hash) = self.transcript_a.as_mut() {
            hash.zeroize();
        }
        if let Some(hash) = self.transcript_b.as_mut() {
            hash.zeroize();
        }
        self.transcript_a = None;
        self.transcript_b = None;
        self.message_a = None;
        self.signer = None;
        self.se_pop = None;
        self.peer_capabilities = None;
        self.negotiated_suite = None;
        self.zeroized = true;
    }

    /// Whether `zeroize` ran.
    pub fn is_zeroized(&self) -> bool {
        self.zeroized
    }
}

impl Drop for HandshakeContext {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::OfferStrategy;
    use crate::pinning::AcceptAllValidator;
    use skybridge_core::MemoryEventSink;
    use skybridge_identity::{MemoryStorage, SecureEnclaveMode, SecureStorage};
    use std::time::Duration;

    fn identity_manager() -> Arc<IdentityKeyManager> {
        Arc::new(IdentityKeyManager::new(
            Arc::new(MemoryStorage::new()),
            ProviderRegistry::full(),
            MemoryEventSink::new(),
            SecureEnclaveMode::Unavailable,
        ))
    }

    fn params(role: Role, identity: Arc<IdentityKeyManager>) -> ContextParams {
        ContextParams {
            role,
            registry: ProviderRegistry::full(),
            identity,
            policy: HandshakePolicy::default(),
            crypto_policy: CryptoPolicy {
                allow_experimental_hybrid: true,
                ..Default::default()
            },
            local_capabilities: CryptoCapabilities::full(),
            config: HandshakeConfig::default(),
            events: MemoryEventSink::new(),
            trusted_peer_kem_keys: HashMap::new(),
            trusted_peer_se_key: None,
        }
    }

    async fn initiator_context(mut p: ContextParams) -> HandshakeContext {
        let sig_algorithm = if p.trusted_peer_kem_keys.is_empty() {
            SignatureAlgorithm::Ed25519
        } else {
            SignatureAlgorithm::MlDsa65
        };
        let (public, handle) = p
            .identity
            .get_or_create_protocol_signing_key(sig_algorithm)
            .await
            .unwrap();
        let signer = protocol_signer_from_handle(sig_algorithm, &public, &handle).unwrap();
        p.role = Role::Initiator;
        HandshakeContext::initiator(p, signer, None)
    }

    async fn roundtrip(offer: OfferStrategy) -> (SessionKeys, SessionKeys) {
        let initiator_identity = identity_manager();
        let responder_identity = identity_manager();
        let replay = ReplayCache::new(Duration::from_secs(60));
        let peer_a = DeviceId::new("initiator-device");
        let peer_b = DeviceId::new("responder-device");

        let mut trusted = HashMap::new();
        if offer == OfferStrategy::PqcOnly {
            for suite in [CipherSuite::MlKem768MlDsa65, CipherSuite::XWingMlDsa] {
                trusted.insert(
                    suite,
                    responder_identity.kem_identity_public_key(suite).await.unwrap(),
                );
            }
        }

        let mut p = params(Role::Initiator, initiator_identity);
        p.trusted_peer_kem_keys = trusted;
        let mut initiator = initiator_context(p).await;

        let offered = OfferedSuites::build(offer, &ProviderRegistry::full());
        let message_a = initiator.build_message_a(&offered).unwrap();

        let mut responder =
            HandshakeContext::responder(params(Role::Responder, responder_identity));
        responder
            .process_message_a(&message_a, &AcceptAllValidator, &replay, &peer_a)
            .await
            .unwrap();

        let (message_b, responder_secret) = responder.build_message_b().await.unwrap();
        let responder_keys = responder.derive_keys(responder_secret).unwrap();

        let initiator_keys = initiator
            .process_message_b(&message_b, &AcceptAllValidator, &replay, &peer_b)
            .await
            .unwrap();

        (initiator_keys, responder_keys)
    }

    #[tokio::test]
    async fn classical_roundtrip_derives_matching_keys() {
        let (initiator, responder) = roundtrip(OfferStrategy::ClassicOnly).await;
        assert_eq!(*initiator.send_key, *responder.receive_key);
        assert_eq!(*initiator.receive_key, *responder.send_key);
        assert_eq!(initiator.transcript_hash, responder.transcript_hash);
        assert_eq!(initiator.negotiated_suite, CipherSuite::X25519Ed25519);
    }

    #[tokio::test]
    async fn pqc_roundtrip_derives_matching_keys() {
        let (initiator, responder) = roundtrip(OfferStrategy::PqcOnly).await;
        assert_eq!(*initiator.send_key, *responder.receive_key);
        assert_eq!(*initiator.receive_key, *responder.send_key);
        assert_eq!(initiator.transcript_hash, responder.transcript_hash);
        // Hybrid is the first preference when the peer key is trusted.
        assert_eq!(initiator.negotiated_suite, CipherSuite::XWingMlDsa);
        assert!(initiator.negotiated_suite.is_pqc_group());
    }

    #[tokio::test]
    async fn tampered_sig_a_is_rejected() {
        let initiator_identity = identity_manager();
        let replay = ReplayCache::new(Duration::from_secs(60));

        let mut initiator = initiator_context(params(Role::Initiator, initiator_identity)).await;
        let offered = OfferedSuites::build(OfferStrategy::ClassicOnly, &ProviderRegistry::full());
        let mut message_a = initiator.build_message_a(&offered).unwrap();
        message_a.signature[0] ^= 0xFF;

        let mut responder = HandshakeContext::responder(params(Role::Responder, identity_manager()));
        let err = responder
            .process_message_a(&message_a, &AcceptAllValidator, &replay, &DeviceId::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::SignatureVerificationFailed));
    }

    #[tokio::test]
    async fn pqc_offer_without_trusted_keys_fails() {
        let mut p = params(Role::Initiator, identity_manager());
        p.trusted_peer_kem_keys = HashMap::new();
        let (public, handle) = p
            .identity
            .get_or_create_protocol_signing_key(SignatureAlgorithm::MlDsa65)
            .await
            .unwrap();
        let signer =
            protocol_signer_from_handle(SignatureAlgorithm::MlDsa65, &public, &handle).unwrap();
        let mut initiator = HandshakeContext::initiator(p, signer, None);

        let offered = OfferedSuites::build(OfferStrategy::PqcOnly, &ProviderRegistry::full());
        assert!(matches!(
            initiator.build_message_a(&offered),
            Err(HandshakeError::SuiteNegotiationFailed(_))
        ));
    }

    #[tokio::test]
    async fn zeroized_context_refuses_everything() {
        let mut context = initiator_context(params(Role::Initiator, identity_manager())).await;
        context.zeroize();
        context.zeroize(); // idempotent
        assert!(context.is_zeroized());

        let offered = OfferedSuites::build(OfferStrategy::ClassicOnly, &ProviderRegistry::full());
        assert!(matches!(
            context.build_message_a(&offered),
            Err(HandshakeError::ContextZeroized)
        ));
    }

    #[tokio::test]
    async fn replayed_message_a_is_detected() {
        let replay = ReplayCache::new(Duration::from_secs(60));
        let mut initiator = initiator_context(params(Role::Initiator, identity_manager())).await;
        let offered = OfferedSuites::build(OfferStrategy::ClassicOnly, &ProviderRegistry::full());
        let message_a = initiator.build_message_a(&offered).unwrap();

        let mut first = HandshakeContext::responder(params(Role::Responder, identity_manager()));
        first
            .process_message_a(&message_a, &AcceptAllValidator, &replay, &DeviceId::new("a"))
            .await
            .unwrap();

        let mut second = HandshakeContext::responder(params(Role::Responder, identity_manager()));
        let err = second
            .process_message_a(&message_a, &AcceptAllValidator, &replay, &DeviceId::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ReplayDetected));
    }

    #[tokio::test]
    async fn forced_classical_selection_is_rejected() {
        // Forced downgrade: the "responder" hands back a classical suite
        // against a PQC offer. Suite-signature compatibility trips first,
        // before any signature check, so the forged message needs no valid
        // sigB.
        let responder_identity = identity_manager();
        let mut trusted = HashMap::new();
        trusted.insert(
            CipherSuite::MlKem768MlDsa65,
            responder_identity
                .kem_identity_public_key(CipherSuite::MlKem768MlDsa65)
                .await
                .unwrap(),
        );

        let events = MemoryEventSink::new();
        let mut p = params(Role::Initiator, identity_manager());
        p.trusted_peer_kem_keys = trusted;
        p.crypto_policy.allow_experimental_hybrid = false;
        p.events = events.clone();
        let mut initiator = initiator_context(p).await;

        let offered = OfferedSuites::build(OfferStrategy::PqcOnly, &ProviderRegistry::full());
        let _message_a = initiator.build_message_a(&offered).unwrap();

        let forged = HandshakeMessageB {
            version: 1,
            selected_suite: CipherSuite::X25519Ed25519,
            responder_share: vec![0u8; 32],
            server_nonce: [9u8; 32],
            encrypted_payload: skybridge_crypto::SealedBox {
                encapsulated_key: vec![0u8; 32],
                nonce: [0u8; 12],
                ciphertext: vec![0u8; 16],
                tag: [0u8; 16],
            },
            signature: vec![0u8; 64],
            identity_key: WireIdentityKey {
                algorithm: SignatureAlgorithm::Ed25519,
                public_key: vec![0u8; 32],
                se_pop_public_key: None,
            },
            se_signature: None,
        };

        let replay = ReplayCache::new(Duration::from_secs(60));
        let err = initiator
            .process_message_b(&forged, &AcceptAllValidator, &replay, &DeviceId::new("evil"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::SuiteSignatureMismatch { .. }));
        assert_eq!(events.named("signature_algorithm_mismatch").len(), 1);
    }

    #[tokio::test]
    async fn downgrade_within_offer_emits_event() {
        // Responder that skips hybrid (no hybrid provider) picks the second
        // preference; the initiator emits crypto_downgrade but proceeds.
        let initiator_identity = identity_manager();
        let responder_identity = Arc::new(IdentityKeyManager::new(
            Arc::new(MemoryStorage::new()),
            ProviderRegistry::new(
                Arc::new(skybridge_crypto::ClassicProvider),
                Some(Arc::new(skybridge_crypto::MlKemProvider)),
                None,
            ),
            MemoryEventSink::new(),
            SecureEnclaveMode::Unavailable,
        ));
        let replay = ReplayCache::new(Duration::from_secs(60));

        let mut trusted = HashMap::new();
        for suite in [CipherSuite::MlKem768MlDsa65, CipherSuite::XWingMlDsa] {
            trusted.insert(
                suite,
                responder_identity.kem_identity_public_key(suite).await.unwrap(),
            );
        }

        let events = MemoryEventSink::new();
        let mut p = params(Role::Initiator, initiator_identity);
        p.trusted_peer_kem_keys = trusted;
        p.events = events.clone();
        let mut initiator = initiator_context(p).await;

        let offered = OfferedSuites::build(OfferStrategy::PqcOnly, &ProviderRegistry::full());
        let message_a = initiator.build_message_a(&offered).unwrap();
        assert_eq!(message_a.supported_suites[0], CipherSuite::XWingMlDsa);

        let mut responder_params = params(Role::Responder, responder_identity);
        responder_params.registry = ProviderRegistry::new(
            Arc::new(skybridge_crypto::ClassicProvider),
            Some(Arc::new(skybridge_crypto::MlKemProvider)),
            None,
        );
        let mut responder = HandshakeContext::responder(responder_params);
        responder
            .process_message_a(&message_a, &AcceptAllValidator, &replay, &DeviceId::new("i"))
            .await
            .unwrap();
        assert_eq!(
            responder.negotiated_suite(),
            Some(CipherSuite::MlKem768MlDsa65)
        );

        let (message_b, _secret) = responder.build_message_b().await.unwrap();
        initiator
            .process_message_b(&message_b, &AcceptAllValidator, &replay, &DeviceId::new("r"))
            .await
            .unwrap();

        let downgrades = events.named("crypto_downgrade");
        assert_eq!(downgrades.len(), 1);
    }

    #[tokio::test]
    async fn storage_backed_kem_keys_survive_for_decapsulation() {
        // The responder's KEM identity key loads from storage on demand.
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let responder_identity = Arc::new(IdentityKeyManager::new(
            storage.clone(),
            ProviderRegistry::full(),
            MemoryEventSink::new(),
            SecureEnclaveMode::Unavailable,
        ));
        let public = responder_identity
            .kem_identity_public_key(CipherSuite::MlKem768MlDsa65)
            .await
            .unwrap();

        // A fresh manager over the same storage sees the same key.
        let reloaded = Arc::new(IdentityKeyManager::new(
            storage,
            ProviderRegistry::full(),
            MemoryEventSink::new(),
            SecureEnclaveMode::Unavailable,
        ));
        assert_eq!(
            reloaded
                .kem_identity_public_key(CipherSuite::MlKem768MlDsa65)
                .await
                .unwrap(),
            public
        );
    }
}
