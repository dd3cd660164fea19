//! Cipher suites and algorithm identifiers.
//!
//! Wire id convention: `0x10xx` marks classical suites, `0x00xx`/`0x01xx`
//! mark hybrid and pure-PQC suites. The ids are stable protocol constants.

use crate::error::CryptoError;
use serde::{Deserialize, Serialize};
use skybridge_core::SecurityTier;
use std::fmt;

/// A negotiable cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    /// X25519 key agreement + Ed25519 signatures (classical).
    X25519Ed25519,

    /// P-256 ECDH + ECDSA. Legacy verification only; never offered for
    /// protocol signing.
    P256Ecdsa,

    /// ML-KEM-768 encapsulation + ML-DSA-65 signatures (pure PQC).
    MlKem768MlDsa65,

    /// X-Wing style X25519 ⊕ ML-KEM-768 + ML-DSA-65 signatures (hybrid).
    XWingMlDsa,
}

impl CipherSuite {
    /// Every suite the protocol knows, strongest tiers first.
    pub const ALL: [CipherSuite; 4] = [
        CipherSuite::XWingMlDsa,
        CipherSuite::MlKem768MlDsa65,
        CipherSuite::X25519Ed25519,
        CipherSuite::P256Ecdsa,
    ];

    /// Stable 16-bit wire identifier.
    pub fn wire_id(self) -> u16 {
        match self {
            Self::X25519Ed25519 => 0x10A1,
            Self::P256Ecdsa => 0x10B2,
            Self::MlKem768MlDsa65 => 0x0101,
            Self::XWingMlDsa => 0x0001,
        }
    }

    /// Resolves a wire identifier back to a suite.
    pub fn from_wire_id(id: u16) -> Result<Self, CryptoError> {
        match id {
            0x10A1 => Ok(Self::X25519Ed25519),
            0x10B2 => Ok(Self::P256Ecdsa),
            0x0101 => Ok(Self::MlKem768MlDsa65),
            0x0001 => Ok(Self::XWingMlDsa),
            other => Err(CryptoError::UnknownSuite(other)),
        }
    }

    /// Whether the KEM is purely post-quantum.
    pub fn is_pqc(self) -> bool {
        matches!(self, Self::MlKem768MlDsa65)
    }

    /// Whether the KEM combines classical and post-quantum components.
    pub fn is_hybrid(self) -> bool {
        matches!(self, Self::XWingMlDsa)
    }

    /// PQC-group membership: pure PQC or hybrid.
    ///
    /// This is the property offered-suite homogeneity and signature-algorithm
    /// coupling are defined over.
    pub fn is_pqc_group(self) -> bool {
        self.is_pqc() || self.is_hybrid()
    }

    /// Security tier of this suite.
    pub fn tier(self) -> SecurityTier {
        if self.is_hybrid() {
            SecurityTier::Hybrid
        } else if self.is_pqc() {
            SecurityTier::Pqc
        } else {
            SecurityTier::Classic
        }
    }

    /// The protocol signing algorithm a MessageA offering this suite must be
    /// signed with.
    pub fn protocol_signature_algorithm(self) -> SignatureAlgorithm {
        if self.is_pqc_group() {
            SignatureAlgorithm::MlDsa65
        } else {
            SignatureAlgorithm::Ed25519
        }
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::X25519Ed25519 => "x25519-ed25519",
            Self::P256Ecdsa => "p256-ecdsa",
            Self::MlKem768MlDsa65 => "mlkem768-mldsa65",
            Self::XWingMlDsa => "xwing-mldsa",
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Signature algorithms known to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// Ed25519 (classical protocol signing).
    Ed25519,

    /// ML-DSA-65 (post-quantum protocol signing).
    MlDsa65,

    /// P-256 ECDSA. Legacy verification and Secure-Enclave PoP only.
    P256Ecdsa,
}

impl SignatureAlgorithm {
    /// Stable 16-bit wire code.
    pub fn wire_code(self) -> u16 {
        match self {
            Self::Ed25519 => 0x0001,
            Self::MlDsa65 => 0x0002,
            Self::P256Ecdsa => 0x0003,
        }
    }

    /// Decodes a wire code.
    pub fn from_wire_code(code: u16) -> Result<Self, CryptoError> {
        match code {
            0x0001 => Ok(Self::Ed25519),
            0x0002 => Ok(Self::MlDsa65),
            0x0003 => Ok(Self::P256Ecdsa),
            other => Err(CryptoError::InvalidKey(format!(
                "unknown signature algorithm wire code {other:#06x}"
            ))),
        }
    }

    /// Whether the algorithm may sign protocol messages (sigA/sigB).
    ///
    /// P-256 never does; it only verifies legacy records and produces
    /// Secure-Enclave PoP signatures.
    pub fn is_protocol_signing(self) -> bool {
        !matches!(self, Self::P256Ecdsa)
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::MlDsa65 => "mldsa65",
            Self::P256Ecdsa => "p256_ecdsa",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// KEM algorithms advertised in capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KemAlgorithm {
    /// X25519 ephemeral Diffie-Hellman used as a KEM.
    X25519,

    /// ML-KEM-768.
    MlKem768,

    /// X-Wing style X25519 ⊕ ML-KEM-768.
    XWingMlKem768,
}

impl KemAlgorithm {
    /// Stable 16-bit wire code.
    pub fn wire_code(self) -> u16 {
        match self {
            Self::X25519 => 0x0001,
            Self::MlKem768 => 0x0002,
            Self::XWingMlKem768 => 0x0003,
        }
    }

    /// Decodes a wire code.
    pub fn from_wire_code(code: u16) -> Result<Self, CryptoError> {
        match code {
            0x0001 => Ok(Self::X25519),
            0x0002 => Ok(Self::MlKem768),
            0x0003 => Ok(Self::XWingMlKem768),
            other => Err(CryptoError::InvalidKey(format!(
                "unknown KEM algorithm wire code {other:#06x}"
            ))),
        }
    }
}

/// AEAD algorithms advertised in capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// AES-256-GCM.
    Aes256Gcm,

    /// ChaCha20-Poly1305.
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// Stable 16-bit wire code.
    pub fn wire_code(self) -> u16 {
        match self {
            Self::Aes256Gcm => 0x0001,
            Self::ChaCha20Poly1305 => 0x0002,
        }
    }

    /// Decodes a wire code.
    pub fn from_wire_code(code: u16) -> Result<Self, CryptoError> {
        match code {
            0x0001 => Ok(Self::Aes256Gcm),
            0x0002 => Ok(Self::ChaCha20Poly1305),
            other => Err(CryptoError::InvalidKey(format!(
                "unknown AEAD algorithm wire code {other:#06x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_follow_tier_convention() {
        for suite in CipherSuite::ALL {
            let id = suite.wire_id();
            if suite.is_pqc_group() {
                assert!(id & 0xF000 == 0x0000, "{suite} id {id:#06x}");
            } else {
                assert!(id & 0xF000 == 0x1000, "{suite} id {id:#06x}");
            }
            assert_eq!(CipherSuite::from_wire_id(id).unwrap(), suite);
        }
        assert!(CipherSuite::from_wire_id(0xFFFF).is_err());
    }

    #[test]
    fn signature_coupling_follows_group() {
        assert_eq!(
            CipherSuite::X25519Ed25519.protocol_signature_algorithm(),
            SignatureAlgorithm::Ed25519
        );
        assert_eq!(
            CipherSuite::MlKem768MlDsa65.protocol_signature_algorithm(),
            SignatureAlgorithm::MlDsa65
        );
        assert_eq!(
            CipherSuite::XWingMlDsa.protocol_signature_algorithm(),
            SignatureAlgorithm::MlDsa65
        );
    }

    #[test]
    fn p256_is_never_protocol_signing() {
        assert!(!SignatureAlgorithm::P256Ecdsa.is_protocol_signing());
        assert!(SignatureAlgorithm::Ed25519.is_protocol_signing());
        assert!(SignatureAlgorithm::MlDsa65.is_protocol_signing());
    }

    #[test]
    fn tiers_are_consistent() {
        use skybridge_core::SecurityTier;
        assert_eq!(CipherSuite::X25519Ed25519.tier(), SecurityTier::Classic);
        assert_eq!(CipherSuite::MlKem768MlDsa65.tier(), SecurityTier::Pqc);
        assert_eq!(CipherSuite::XWingMlDsa.tier(), SecurityTier::Hybrid);
        assert!(CipherSuite::XWingMlDsa.is_pqc_group());
        assert!(!CipherSuite::XWingMlDsa.is_pqc());
    }
}
