//! Cipher-suite providers.
//!
//! A provider owns the KEM operations for the suites of one security tier.
//! The handshake context talks only to this trait; algorithm crates never
//! leak upward.

use crate::aead::{self, SealedBox};
use crate::error::{CryptoError, Result};
use crate::kem;
use crate::keys::{KemKeypair, SharedSecret};
use crate::suite::CipherSuite;
use skybridge_core::SecurityTier;
use std::sync::Arc;

/// KEM and sealed-box operations for one tier of cipher suites.
pub trait CryptoProvider: Send + Sync {
    /// Tier this provider serves.
    fn tier(&self) -> SecurityTier;

    /// Suites this provider implements, preference order.
    fn supported_suites(&self) -> Vec<CipherSuite>;

    /// Generates a KEM keypair for a suite.
    fn kem_generate_keypair(&self, suite: CipherSuite) -> Result<KemKeypair>;

    /// Encapsulates to a peer public key, yielding the wire encapsulation and
    /// the local copy of the shared secret.
    fn kem_encapsulate(
        &self,
        suite: CipherSuite,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret)>;

    /// Recovers the shared secret from an encapsulation.
    fn kem_decapsulate(&self, keypair: &KemKeypair, encapsulated: &[u8]) -> Result<SharedSecret>;

    /// KEM-DEM: encapsulates to `peer_public` and seals `plaintext` under the
    /// fresh shared secret. Returns the sealed box (carrying the
    /// encapsulation) and the shared secret for the session key schedule.
    fn kem_dem_seal(
        &self,
        suite: CipherSuite,
        peer_public: &[u8],
        salt: &[u8],
        info: &[u8],
        plaintext: &[u8],
    ) -> Result<(SealedBox, SharedSecret)> {
        let (encapsulated_key, shared_secret) = self.kem_encapsulate(suite, peer_public)?;
        let mut sealed = aead::seal_with_secret(&shared_secret, salt, info, plaintext)?;
        sealed.encapsulated_key = encapsulated_key;
        Ok((sealed, shared_secret))
    }

    /// KEM-DEM inverse: decapsulates the box's key and opens the payload.
    /// Returns the plaintext and the recovered shared secret.
    fn kem_dem_open_with_secret(
        &self,
        keypair: &KemKeypair,
        sealed: &SealedBox,
        salt: &[u8],
        info: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret)> {
        let shared_secret = self.kem_decapsulate(keypair, &sealed.encapsulated_key)?;
        let plaintext = aead::open_with_secret(&shared_secret, salt, info, sealed)?;
        Ok((plaintext, shared_secret))
    }
}

fn ensure_supported(provider: &dyn CryptoProvider, suite: CipherSuite) -> Result<()> {
    if provider.supported_suites().contains(&suite) {
        Ok(())
    } else {
        Err(CryptoError::UnsupportedSuite(suite))
    }
}

/// Classical tier: X25519 key agreement.
#[derive(Debug, Default, Clone)]
pub struct ClassicProvider;

impl CryptoProvider for ClassicProvider {
    fn tier(&self) -> SecurityTier {
        SecurityTier::Classic
    }

    fn supported_suites(&self) -> Vec<CipherSuite> {
        vec![CipherSuite::X25519Ed25519]
    }

    fn kem_generate_keypair(&self, suite: CipherSuite) -> Result<KemKeypair> {
        ensure_supported(self, suite)?;
        let (public_key, secret_key) = kem::x25519::generate_keypair();
        Ok(KemKeypair {
            suite,
            public_key,
            secret_key,
        })
    }

    fn kem_encapsulate(
        &self,
        suite: CipherSuite,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret)> {
        ensure_supported(self, suite)?;
        kem::x25519::encapsulate(peer_public)
    }

    fn kem_decapsulate(&self, keypair: &KemKeypair, encapsulated: &[u8]) -> Result<SharedSecret> {
        ensure_supported(self, keypair.suite)?;
        kem::x25519::decapsulate(&keypair.secret_key, encapsulated)
    }
}

/// Pure post-quantum tier: ML-KEM-768.
#[derive(Debug, Default, Clone)]
pub struct MlKemProvider;

impl CryptoProvider for MlKemProvider {
    fn tier(&self) -> SecurityTier {
        SecurityTier::Pqc
    }

    fn supported_suites(&self) -> Vec<CipherSuite> {
        vec![CipherSuite::MlKem768MlDsa65]
    }

    fn kem_generate_keypair(&self, suite: CipherSuite) -> Result<KemKeypair> {
        ensure_supported(self, suite)?;
        let (public_key, secret_key) = kem::mlkem768::generate_keypair();
        Ok(KemKeypair {
            suite,
            public_key,
            secret_key,
        })
    }

    fn kem_encapsulate(
        &self,
        suite: CipherSuite,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret)> {
        ensure_supported(self, suite)?;
        kem::mlkem768::encapsulate(peer_public)
    }

    fn kem_decapsulate(&self, keypair: &KemKeypair, encapsulated: &[u8]) -> Result<SharedSecret> {
        ensure_supported(self, keypair.suite)?;
        kem::mlkem768::decapsulate(&keypair.secret_key, encapsulated)
    }
}

/// Hybrid tier: X-Wing style X25519 ⊕ ML-KEM-768.
#[derive(Debug, Default, Clone)]
pub struct HybridProvider;

impl CryptoProvider for HybridProvider {
    fn tier(&self) -> SecurityTier {
        SecurityTier::Hybrid
    }

    fn supported_suites(&self) -> Vec<CipherSuite> {
        vec![CipherSuite::XWingMlDsa]
    }

    fn kem_generate_keypair(&self, suite: CipherSuite) -> Result<KemKeypair> {
        ensure_supported(self, suite)?;
        let (public_key, secret_key) = kem::xwing::generate_keypair();
        Ok(KemKeypair {
            suite,
            public_key,
            secret_key,
        })
    }

    fn kem_encapsulate(
        &self,
        suite: CipherSuite,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, SharedSecret)> {
        ensure_supported(self, suite)?;
        kem::xwing::encapsulate(peer_public)
    }

    fn kem_decapsulate(&self, keypair: &KemKeypair, encapsulated: &[u8]) -> Result<SharedSecret> {
        ensure_supported(self, keypair.suite)?;
        kem::xwing::decapsulate(&keypair.secret_key, &keypair.public_key, encapsulated)
    }
}

/// All providers a device carries, dispatchable by suite.
#[derive(Clone)]
pub struct ProviderRegistry {
    classic: Arc<dyn CryptoProvider>,
    pqc: Option<Arc<dyn CryptoProvider>>,
    hybrid: Option<Arc<dyn CryptoProvider>>,
}

impl ProviderRegistry {
    /// Registry with every built-in provider.
    pub fn full() -> Self {
        Self {
            classic: Arc::new(ClassicProvider),
            pqc: Some(Arc::new(MlKemProvider)),
            hybrid: Some(Arc::new(HybridProvider)),
        }
    }

    /// Registry for a device without post-quantum support.
    pub fn classic_only() -> Self {
        Self {
            classic: Arc::new(ClassicProvider),
            pqc: None,
            hybrid: None,
        }
    }

    /// Builds a registry from explicit providers.
    pub fn new(
        classic: Arc<dyn CryptoProvider>,
        pqc: Option<Arc<dyn CryptoProvider>>,
        hybrid: Option<Arc<dyn CryptoProvider>>,
    ) -> Self {
        Self {
            classic,
            pqc,
            hybrid,
        }
    }

    /// Whether any PQC-group provider is present.
    pub fn pqc_available(&self) -> bool {
        self.pqc.is_some() || self.hybrid.is_some()
    }

    /// The provider implementing a given suite.
    pub fn provider_for_suite(&self, suite: CipherSuite) -> Result<Arc<dyn CryptoProvider>> {
        let provider = if suite.is_hybrid() {
            self.hybrid.clone()
        } else if suite.is_pqc() {
            self.pqc.clone()
        } else {
            Some(self.classic.clone())
        };
        provider
            .filter(|p| p.supported_suites().contains(&suite))
            .ok_or(CryptoError::UnsupportedSuite(suite))
    }

    /// Suites in the PQC group this registry can run, preference order
    /// (hybrid before pure PQC).
    pub fn pqc_group_suites(&self) -> Vec<CipherSuite> {
        let mut suites = Vec::new();
        if let Some(hybrid) = &self.hybrid {
            suites.extend(hybrid.supported_suites());
        }
        if let Some(pqc) = &self.pqc {
            suites.extend(pqc.supported_suites());
        }
        suites
    }

    /// Classical suites this registry can run.
    pub fn classic_suites(&self) -> Vec<CipherSuite> {
        self.classic.supported_suites()
    }
}
