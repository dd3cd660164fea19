//! Shared fixtures for the end-to-end handshake tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use skybridge_core::{
    CryptoPolicy, DeviceId, EventSink, HandshakePolicy, MemoryEventSink, Role,
};
use skybridge_crypto::sign::protocol_signer_from_handle;
use skybridge_crypto::{CipherSuite, ProviderRegistry, SignatureAlgorithm};
use skybridge_handshake::context::ContextParams;
use skybridge_handshake::driver::DriverParams;
use skybridge_handshake::transport::FrameTransport;
use skybridge_handshake::{
    AcceptAllValidator, CryptoCapabilities, HandshakeConfig, HandshakeContext, HandshakeDriver,
    HandshakeMetrics, ReplayCache,
};
use skybridge_identity::{IdentityKeyManager, MemoryStorage, SecureEnclaveMode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A device-under-test: identity, events, ids.
pub struct TestDevice {
    pub device_id: DeviceId,
    pub identity: Arc<IdentityKeyManager>,
    pub events: Arc<MemoryEventSink>,
    pub registry: ProviderRegistry,
}

impl TestDevice {
    pub fn new(name: &str, registry: ProviderRegistry) -> Self {
        let events = MemoryEventSink::new();
        let identity = Arc::new(IdentityKeyManager::new(
            Arc::new(MemoryStorage::new()),
            registry.clone(),
            events.clone(),
            SecureEnclaveMode::Unavailable,
        ));
        Self {
            device_id: DeviceId::new(name),
            identity,
            events,
            registry,
        }
    }

    pub fn full(name: &str) -> Self {
        Self::new(name, ProviderRegistry::full())
    }

    pub fn classic_only(name: &str) -> Self {
        Self::new(name, ProviderRegistry::classic_only())
    }

    /// The peer KEM identity keys another device needs to offer PQC suites
    /// to this one.
    pub async fn kem_public_keys(&self) -> HashMap<CipherSuite, Vec<u8>> {
        let mut keys = HashMap::new();
        for suite in [CipherSuite::MlKem768MlDsa65, CipherSuite::XWingMlDsa] {
            if self.registry.provider_for_suite(suite).is_ok() {
                keys.insert(
                    suite,
                    self.identity.kem_identity_public_key(suite).await.unwrap(),
                );
            }
        }
        keys
    }

    pub fn context_params(
        &self,
        role: Role,
        config: HandshakeConfig,
        trusted_peer_kem_keys: HashMap<CipherSuite, Vec<u8>>,
    ) -> ContextParams {
        ContextParams {
            role,
            registry: self.registry.clone(),
            identity: self.identity.clone(),
            policy: HandshakePolicy::default(),
            crypto_policy: CryptoPolicy {
                allow_experimental_hybrid: true,
                ..Default::default()
            },
            local_capabilities: CryptoCapabilities::full(),
            config,
            events: self.events.clone(),
            trusted_peer_kem_keys,
            trusted_peer_se_key: None,
        }
    }

    pub async fn initiator_context(
        &self,
        params: ContextParams,
        sig_algorithm: SignatureAlgorithm,
    ) -> HandshakeContext {
        let (public, handle) = self
            .identity
            .get_or_create_protocol_signing_key(sig_algorithm)
            .await
            .unwrap();
        let signer = protocol_signer_from_handle(sig_algorithm, &public, &handle).unwrap();
        HandshakeContext::initiator(params, signer, None)
    }
}

pub fn driver_params(
    transport: Arc<dyn FrameTransport>,
    events: Arc<MemoryEventSink>,
    config: HandshakeConfig,
    replay: Arc<ReplayCache>,
) -> DriverParams {
    DriverParams {
        transport,
        validator: Arc::new(AcceptAllValidator),
        config,
        events: events as Arc<dyn EventSink>,
        metrics: Arc::new(HandshakeMetrics::new()),
        replay,
    }
}

pub fn test_config() -> HandshakeConfig {
    HandshakeConfig {
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn fresh_replay() -> Arc<ReplayCache> {
    Arc::new(ReplayCache::new(Duration::from_secs(300)))
}

/// Transport that records outbound payloads instead of delivering them.
#[derive(Default)]
pub struct CollectTransport {
    frames: Mutex<Vec<(DeviceId, Vec<u8>)>>,
}

impl CollectTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<(DeviceId, Vec<u8>)> {
        self.frames.lock().clone()
    }

    pub fn take(&self) -> Vec<(DeviceId, Vec<u8>)> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub async fn wait_for_frames(&self, count: usize) -> Vec<(DeviceId, Vec<u8>)> {
        for _ in 0..200 {
            if self.frames.lock().len() >= count {
                return self.frames();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} frames, got {}", self.frames.lock().len());
    }
}

#[async_trait]
impl FrameTransport for CollectTransport {
    async fn send(
        &self,
        peer: &DeviceId,
        payload: Vec<u8>,
    ) -> skybridge_handshake::Result<()> {
        self.frames.lock().push((peer.clone(), payload));
        Ok(())
    }
}

/// Builds a wired initiator/responder driver pair over an inline memory
/// transport.
pub struct DriverPair {
    pub initiator: Arc<HandshakeDriver>,
    pub responder: Arc<HandshakeDriver>,
    pub initiator_device: TestDevice,
    pub responder_device: TestDevice,
}

pub async fn wired_pair(
    offered: skybridge_handshake::OfferedSuites,
    sig_algorithm: SignatureAlgorithm,
    seed_trust: bool,
) -> DriverPair {
    let transport = skybridge_handshake::MemoryTransport::new();
    let replay = fresh_replay();
    let config = test_config();

    let initiator_device = TestDevice::full("initiator-device");
    let responder_device = TestDevice::full("responder-device");

    let trusted = if seed_trust {
        responder_device.kem_public_keys().await
    } else {
        HashMap::new()
    };

    let initiator_context = initiator_device
        .initiator_context(
            initiator_device.context_params(Role::Initiator, config.clone(), trusted),
            sig_algorithm,
        )
        .await;
    let initiator = Arc::new(
        HandshakeDriver::initiator(
            responder_device.device_id.clone(),
            initiator_context,
            offered,
            driver_params(
                transport.clone(),
                initiator_device.events.clone(),
                config.clone(),
                replay.clone(),
            ),
        )
        .unwrap(),
    );

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
                config,
                replay,
            ),
        )
        .unwrap(),
    );

    transport.register(initiator_device.device_id.clone(), initiator.clone());
    transport.register(responder_device.device_id.clone(), responder.clone());

    DriverPair {
        initiator,
        responder,
        initiator_device,
        responder_device,
    }
}
