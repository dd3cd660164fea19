//! The two-attempt PQC → classical fallback manager.
//!
//! Offered suites are homogeneous, so one handshake can never offer both
//! families at once. Interoperability with classical-only peers comes from
//! sequencing: attempt `pqc_only`, and on a whitelisted failure (never a
//! timeout) retry once with `classic_only`, rate-limited per peer.

use crate::config::HandshakeConfig;
use crate::context::{ContextParams, HandshakeContext};
use crate::driver::{DriverParams, HandshakeDriver};
use crate::error::{HandshakeError, Result};
use crate::keyschedule::SessionKeys;
use crate::metrics::HandshakeMetrics;
use crate::negotiation::{signature_algorithm_for_offer, OfferStrategy, OfferedSuites};
use crate::pinning::IdentityValidator;
use crate::replay::ReplayCache;
use crate::transport::FrameTransport;
use dashmap::DashMap;
use skybridge_core::{
    CryptoPolicy, DeviceId, EventSink, HandshakePolicy, Role, SecurityEvent,
};
use skybridge_crypto::sign::protocol_signer_from_handle;
use skybridge_crypto::{CipherSuite, CryptoCapabilities, ProviderRegistry};
use skybridge_identity::{IdentityKeyManager, TrustStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-peer fallback rate limiter on a monotonic clock.
///
/// A wall-clock rewind must never forgive a cooldown, so `Instant` is the
/// only time source here.
pub struct FallbackRateLimiter {
    cooldown: Duration,
    last_fallback: DashMap<DeviceId, Instant>,
}

impl FallbackRateLimiter {
    /// Creates a limiter with the given cooldown.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fallback: DashMap::new(),
        }
    }

    /// The configured cooldown.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Records a fallback for `peer` if none is inside the cooldown.
    ///
    /// Refusals return the remaining cooldown in whole seconds (at least 1).
    pub fn check_and_record(&self, peer: &DeviceId) -> std::result::Result<(), u64> {
        let now = Instant::now();
        match self.last_fallback.entry(peer.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let elapsed = now.duration_since(*entry.get());
                if elapsed < self.cooldown {
                    let remaining = (self.cooldown - elapsed).as_secs().max(1);
                    Err(remaining)
                } else {
                    entry.insert(now);
                    Ok(())
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                Ok(())
            }
        }
    }
}

/// Strategy preferences for the two-attempt sequence.
#[derive(Debug, Clone, Copy)]
pub struct TwoAttemptConfig {
    /// Attempt `pqc_only` first when a PQC provider exists.
    pub prefer_pqc: bool,
}

impl Default for TwoAttemptConfig {
    fn default() -> Self {
        Self { prefer_pqc: true }
    }
}

/// Result of a two-attempt establishment.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// The derived session keys.
    pub keys: SessionKeys,

    /// Strategy of the attempt that succeeded.
    pub strategy: OfferStrategy,

    /// Whether the classical fallback was taken.
    pub is_fallback: bool,
}

/// Hook the embedder uses to wire each attempt's driver into its inbound
/// demultiplexer before MessageA goes out.
pub type DriverHook = Box<dyn Fn(Arc<HandshakeDriver>) + Send + Sync>;

/// Everything the manager needs to run attempts.
pub struct TwoAttemptParams {
    /// Cipher-suite providers.
    pub registry: ProviderRegistry,
    /// Long-term key manager.
    pub identity: Arc<IdentityKeyManager>,
    /// Trust store for peer KEM keys and pinned SE keys. Optional: without
    /// one, PQC attempts degrade to `suite_negotiation_failed` on first
    /// contact.
    pub trust: Option<Arc<TrustStore>>,
    /// Outbound transport.
    pub transport: Arc<dyn FrameTransport>,
    /// Post-signature identity validation hook.
    pub validator: Arc<dyn IdentityValidator>,
    /// Security-event sink.
    pub events: Arc<dyn EventSink>,
    /// Metrics collector.
    pub metrics: Arc<HandshakeMetrics>,
    /// Replay cache.
    pub replay: Arc<ReplayCache>,
    /// Driver configuration.
    pub config: HandshakeConfig,
    /// Downgrade-resistance policy.
    pub policy: HandshakePolicy,
    /// Local crypto preferences.
    pub crypto_policy: CryptoPolicy,
    /// Advertised capabilities.
    pub capabilities: CryptoCapabilities,
    /// Strategy preferences.
    pub attempt_config: TwoAttemptConfig,
    /// Inbound-wiring hook, called once per attempt.
    pub driver_hook: DriverHook,
}

/// Sequences up to two handshake attempts against one peer.
pub struct TwoAttemptManager {
    params: TwoAttemptParams,
    limiter: FallbackRateLimiter,
}

impl TwoAttemptManager {
    /// Creates a manager; the fallback cooldown comes from the handshake
    /// config.
    pub fn new(params: TwoAttemptParams) -> Self {
        let limiter = FallbackRateLimiter::new(params.config.fallback_cooldown);
        Self { params, limiter }
    }

    /// The rate limiter (exposed for diagnostics).
    pub fn limiter(&self) -> &FallbackRateLimiter {
        &self.limiter
    }

    /// Establishes a session with `peer`, falling back at most once.
    pub async fn establish(&self, peer: &DeviceId) -> Result<HandshakeOutcome> {
        let policy = &self.params.policy;
        let prefer_pqc = self.params.attempt_config.prefer_pqc;

        if policy.require_pqc && !prefer_pqc {
            return Err(HandshakeError::PqcProviderUnavailable);
        }

        if !prefer_pqc {
            let keys = self.attempt(peer, OfferStrategy::ClassicOnly).await?;
            return Ok(HandshakeOutcome {
                keys,
                strategy: OfferStrategy::ClassicOnly,
                is_fallback: false,
            });
        }

        let first_failure = match self.attempt(peer, OfferStrategy::PqcOnly).await {
            Ok(keys) => {
                return Ok(HandshakeOutcome {
                    keys,
                    strategy: OfferStrategy::PqcOnly,
                    is_fallback: false,
                })
            }
            Err(err) => err,
        };

        if !policy.allow_classic_fallback {
            return Err(first_failure);
        }
        if !first_failure.is_fallback_eligible() {
            // The blacklist, timeouts in particular, propagates untouched:
            // induced packet loss must never buy an attacker a downgrade.
            return Err(first_failure);
        }

        if let Err(remaining) = self.limiter.check_and_record(peer) {
            tracing::warn!(
                peer = %peer,
                remaining_seconds = remaining,
                "classic fallback refused by rate limiter"
            );
            return Err(first_failure);
        }

        self.params.metrics.record_fallback();
        self.params.events.emit(SecurityEvent::CryptoDowngrade {
            proposed_suite: None,
            selected_suite: None,
            proposed_wire_id: None,
            selected_wire_id: None,
            from_strategy: Some(OfferStrategy::PqcOnly.as_str().to_string()),
            to_strategy: Some(OfferStrategy::ClassicOnly.as_str().to_string()),
            cooldown_seconds: Some(self.limiter.cooldown().as_secs()),
            cooldown_remaining_seconds: Some(0),
            policy: *policy,
            reason: first_failure.reason_code().to_string(),
        });

        let keys = self.attempt(peer, OfferStrategy::ClassicOnly).await?;
        Ok(HandshakeOutcome {
            keys,
            strategy: OfferStrategy::ClassicOnly,
            is_fallback: true,
        })
    }

    /// Prepares and runs one attempt: offer, signer, trusted keys, context,
    /// driver.
    async fn attempt(&self, peer: &DeviceId, strategy: OfferStrategy) -> Result<SessionKeys> {
        let offered = OfferedSuites::build(strategy, &self.params.registry);
        if offered.is_empty() {
            return Err(offered.empty_error());
        }

        let sig_algorithm = signature_algorithm_for_offer(&offered.suites)?;
        let (public_key, handle) = self
            .params
            .identity
            .get_or_create_protocol_signing_key(sig_algorithm)
            .await?;
        let signer = protocol_signer_from_handle(sig_algorithm, &public_key, &handle)?;

        let se_pop = self.params.identity.se_pop().await?;
        if self.params.policy.require_secure_enclave_pop && se_pop.is_none() {
            return Err(HandshakeError::SecureEnclavePopRequired);
        }

        let (trusted_peer_kem_keys, trusted_peer_se_key) = self.trusted_peer_keys(peer).await?;

        let context = HandshakeContext::initiator(
            ContextParams {
                role: Role::Initiator,
                registry: self.params.registry.clone(),
                identity: self.params.identity.clone(),
                policy: self.params.policy,
                crypto_policy: self.params.crypto_policy,
                local_capabilities: self.params.capabilities.clone(),
                config: self.params.config.clone(),
                events: self.params.events.clone(),
                trusted_peer_kem_keys,
                trusted_peer_se_key,
            },
            signer,
            se_pop,
        );

        let driver = Arc::new(HandshakeDriver::initiator(
            peer.clone(),
            context,
            offered,
            DriverParams {
                transport: self.params.transport.clone(),
                validator: self.params.validator.clone(),
                config: self.params.config.clone(),
                events: self.params.events.clone(),
                metrics: self.params.metrics.clone(),
                replay: self.params.replay.clone(),
            },
        )?);
        (self.params.driver_hook)(driver.clone());

        driver.initiate_handshake().await
    }

    async fn trusted_peer_keys(
        &self,
        peer: &DeviceId,
    ) -> Result<(HashMap<CipherSuite, Vec<u8>>, Option<Vec<u8>>)> {
        let Some(trust) = &self.params.trust else {
            return Ok((HashMap::new(), None));
        };
        let Some(record) = trust.record(peer).await? else {
            return Ok((HashMap::new(), None));
        };

        let mut kem_keys = HashMap::new();
        for (&wire_id, entry) in &record.kem_public_keys {
            if let Ok(suite) = CipherSuite::from_wire_id(wire_id) {
                kem_keys.insert(suite, entry.0.clone());
            }
        }
        Ok((kem_keys, record.secure_enclave_public_key.clone()))
    }
}
