//! Two-attempt strategy scenarios: fallback on whitelisted failures,
//! never on timeouts.

mod common;

use common::{driver_params, fresh_replay, test_config, TestDevice};
use parking_lot::Mutex;
use skybridge_core::{CryptoPolicy, HandshakePolicy, Role};
use skybridge_crypto::CipherSuite;
use skybridge_handshake::transport::BlackholeTransport;
use skybridge_handshake::{
    AcceptAllValidator, CryptoCapabilities, HandshakeContext, HandshakeDriver, HandshakeError,
    HandshakeMetrics, MemoryTransport, OfferStrategy, TwoAttemptConfig, TwoAttemptManager,
};
use skybridge_handshake::fallback::TwoAttemptParams;
use skybridge_identity::{TrustRecord, TrustStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Scenario: PQC attempt fails locally with `suite_negotiation_failed`
/// (no trusted peer KEM keys yet), the manager emits `crypto_downgrade`
/// with strategy context and the classical attempt succeeds end to end.
#[tokio::test]
async fn whitelisted_failure_falls_back_and_succeeds() {
    let transport = MemoryTransport::new();
    let replay = fresh_replay();
    let config = test_config();

    let initiator_device = TestDevice::full("fallback-initiator");
    let responder_device = TestDevice::full("fallback-responder");

    // Real responder wired for the classical attempt.
    let responder_context = HandshakeContext::responder(responder_device.context_params(
        Role::Responder,
        config.clone(),
        HashMap::new(),
    ));
    let responder = Arc::new(
        HandshakeDriver::responder(
            initiator_device.device_id.clone(),
            responder_context,
            driver_params(
                transport.clone(),
                responder_device.events.clone(),
                config.clone(),
                replay.clone(),
            ),
        )
        .unwrap(),
    );
    transport.register(responder_device.device_id.clone(), responder.clone());

    // No trust record exists, so the PQC attempt cannot build an offer:
    // every PQC suite needs a trusted peer KEM key.
    let hook_transport = transport.clone();
    let hook_device = initiator_device.device_id.clone();
    let manager = TwoAttemptManager::new(TwoAttemptParams {
        registry: initiator_device.registry.clone(),
        identity: initiator_device.identity.clone(),
        trust: None,
        transport: transport.clone(),
        validator: Arc::new(AcceptAllValidator),
        events: initiator_device.events.clone(),
        metrics: Arc::new(HandshakeMetrics::new()),
        replay,
        config,
        policy: HandshakePolicy::default(),
        crypto_policy: CryptoPolicy {
            allow_experimental_hybrid: true,
            ..Default::default()
        },
        capabilities: CryptoCapabilities::full(),
        attempt_config: TwoAttemptConfig { prefer_pqc: true },
        driver_hook: Box::new(move |driver| {
            hook_transport.register(hook_device.clone(), driver);
        }),
    });

    let outcome = manager
        .establish(&responder_device.device_id)
        .await
        .unwrap();
    assert!(outcome.is_fallback);
    assert_eq!(outcome.strategy, OfferStrategy::ClassicOnly);
    assert_eq!(outcome.keys.negotiated_suite, CipherSuite::X25519Ed25519);

    let downgrades = initiator_device.events.named("crypto_downgrade");
    assert_eq!(downgrades.len(), 1);
    let ctx = downgrades[0].context();
    assert!(ctx.contains(&("from_strategy", "pqc_only".to_string())));
    assert!(ctx.contains(&("to_strategy", "classic_only".to_string())));
    assert!(ctx.contains(&("cooldown_seconds", "300".to_string())));
    assert!(ctx.contains(&("reason", "suite_negotiation_failed".to_string())));

    let responder_keys = responder.completed().await.unwrap();
    assert_eq!(*outcome.keys.send_key, *responder_keys.receive_key);
}

/// Scenario: the PQC attempt times out. Timeouts are blacklisted, so the
/// error propagates, no fallback runs and no downgrade event is emitted.
#[tokio::test]
async fn timeout_never_triggers_fallback() {
    let replay = fresh_replay();
    let config = skybridge_handshake::HandshakeConfig {
        timeout: Duration::from_millis(80),
        ..Default::default()
    };

    let initiator_device = TestDevice::full("timeout-initiator");
    let responder_device = TestDevice::full("timeout-responder");

    // Seed a trust record so the PQC attempt actually sends MessageA (and
    // then hears nothing back).
    let trust = Arc::new(TrustStore::new(
        Arc::new(skybridge_identity::MemoryStorage::new()),
        initiator_device.events.clone(),
    ));
    let mut record = TrustRecord::new(
        responder_device.device_id.clone(),
        vec![0xAB; 1952],
        skybridge_crypto::SignatureAlgorithm::MlDsa65,
    );
    for (suite, key) in responder_device.kem_public_keys().await {
        record.set_kem_public_key(suite, key);
    }
    trust.upsert(record).await.unwrap();

    let attempts = Arc::new(Mutex::new(0usize));
    let attempts_hook = attempts.clone();
    let manager = TwoAttemptManager::new(TwoAttemptParams {
        registry: initiator_device.registry.clone(),
        identity: initiator_device.identity.clone(),
        trust: Some(trust),
        transport: Arc::new(BlackholeTransport),
        validator: Arc::new(AcceptAllValidator),
        events: initiator_device.events.clone(),
        metrics: Arc::new(HandshakeMetrics::new()),
        replay,
        config,
        policy: HandshakePolicy {
            allow_classic_fallback: true,
            ..Default::default()
        },
        crypto_policy: CryptoPolicy {
            allow_experimental_hybrid: true,
            ..Default::default()
        },
        capabilities: CryptoCapabilities::full(),
        attempt_config: TwoAttemptConfig { prefer_pqc: true },
        driver_hook: Box::new(move |_| {
            *attempts_hook.lock() += 1;
        }),
    });

    let err = manager
        .establish(&responder_device.device_id)
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::Timeout));

    // Exactly one attempt ran, and nothing was downgraded.
    assert_eq!(*attempts.lock(), 1);
    assert!(initiator_device.events.named("crypto_downgrade").is_empty());
}
