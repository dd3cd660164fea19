//! Negotiation policies and security tiers.
//!
//! `HandshakePolicy` travels inside MessageA and is bound into the transcript
//! (policy-in-transcript), so a downgraded counterparty can never claim a
//! weaker policy was in force. `CryptoPolicy` is local-only configuration and
//! never appears on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error raised when a canonical policy encoding cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecodeError {
    /// The encoding was not exactly [`HandshakePolicy::WIRE_LEN`] bytes.
    #[error("Invalid policy encoding length: expected {expected}, got {actual}")]
    Length {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// An unknown security tier code was encountered.
    #[error("Unknown security tier code: {0:#04x}")]
    UnknownTier(u8),

    /// A boolean field carried a value other than 0 or 1.
    #[error("Invalid boolean byte in policy encoding: {0:#04x}")]
    InvalidBool(u8),
}

/// Security tier of a cipher suite or a policy floor.
///
/// Ordered: `Classic < Pqc < Hybrid`, so `tier >= minimum_tier` expresses the
/// policy floor directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum SecurityTier {
    /// Classical elliptic-curve cryptography only.
    #[default]
    Classic,

    /// Pure post-quantum KEM.
    Pqc,

    /// Classical and post-quantum KEMs combined.
    Hybrid,
}

impl SecurityTier {
    /// Wire code used in canonical encodings.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::Classic => 0x01,
            Self::Pqc => 0x02,
            Self::Hybrid => 0x03,
        }
    }

    /// Decodes a tier from its wire code.
    pub fn from_wire_code(code: u8) -> Result<Self, PolicyDecodeError> {
        match code {
            0x01 => Ok(Self::Classic),
            0x02 => Ok(Self::Pqc),
            0x03 => Ok(Self::Hybrid),
            other => Err(PolicyDecodeError::UnknownTier(other)),
        }
    }
}

impl fmt::Display for SecurityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Pqc => write!(f, "pqc"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Downgrade-resistance policy carried in MessageA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePolicy {
    /// Reject any negotiation that ends on a non-PQC suite.
    pub require_pqc: bool,

    /// Permit the two-attempt manager to retry with classical suites.
    pub allow_classic_fallback: bool,

    /// Lowest acceptable tier for the selected suite.
    pub minimum_tier: SecurityTier,

    /// Fail the handshake unless a hardware-backed proof-of-possession
    /// signature is produced.
    pub require_secure_enclave_pop: bool,
}

impl HandshakePolicy {
    /// Length of the fixed-width canonical encoding.
    pub const WIRE_LEN: usize = 4;

    /// Fixed-width canonical encoding, identical on the wire and in the
    /// transcript.
    pub fn canonical_bytes(&self) -> [u8; Self::WIRE_LEN] {
        [
            self.require_pqc as u8,
            self.allow_classic_fallback as u8,
            self.minimum_tier.wire_code(),
            self.require_secure_enclave_pop as u8,
        ]
    }

    /// Decodes the fixed-width canonical encoding.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, PolicyDecodeError> {
        if bytes.len() != Self::WIRE_LEN {
            return Err(PolicyDecodeError::Length {
                expected: Self::WIRE_LEN,
                actual: bytes.len(),
            });
        }
        let decode_bool = |b: u8| match b {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PolicyDecodeError::InvalidBool(other)),
        };
        Ok(Self {
            require_pqc: decode_bool(bytes[0])?,
            allow_classic_fallback: decode_bool(bytes[1])?,
            minimum_tier: SecurityTier::from_wire_code(bytes[2])?,
            require_secure_enclave_pop: decode_bool(bytes[3])?,
        })
    }
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            require_pqc: false,
            allow_classic_fallback: true,
            minimum_tier: SecurityTier::Classic,
            require_secure_enclave_pop: false,
        }
    }
}

/// Local cryptographic preferences. Never serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoPolicy {
    /// Offer hybrid (classical + PQC) suites that are still experimental.
    pub allow_experimental_hybrid: bool,

    /// Include hybrid suites in MessageA when they are otherwise eligible.
    pub advertise_hybrid: bool,

    /// Reject a non-hybrid selection when a hybrid suite was offered and the
    /// peer held the KEM key for it.
    pub require_hybrid_if_available: bool,

    /// Local floor applied before building an offer.
    pub minimum_security_tier: SecurityTier,
}

impl Default for CryptoPolicy {
    fn default() -> Self {
        Self {
            allow_experimental_hybrid: false,
            advertise_hybrid: true,
            require_hybrid_if_available: false,
            minimum_security_tier: SecurityTier::Classic,
        }
    }
}
