//! The handshake error taxonomy.
//!
//! One exhaustive sum type; every failure funnels through
//! `transition_to_failed` with one of these values, and the two-attempt
//! manager decides fallback eligibility from the value alone.

use skybridge_crypto::{CipherSuite, CryptoError, SignatureAlgorithm};
use thiserror::Error;

/// Type alias for Results in this crate.
pub type Result<T> = std::result::Result<T, HandshakeError>;

/// Everything that can go wrong while establishing a session.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// `initiate_handshake` was called while a handshake was in flight.
    #[error("A handshake is already in progress")]
    AlreadyInProgress,

    /// An operation touched a context after `zeroize()`.
    #[error("Handshake context has been zeroized")]
    ContextZeroized,

    /// The peer did not answer within the deadline.
    #[error("Handshake timed out")]
    Timeout,

    /// The handshake was cancelled locally.
    #[error("Handshake was cancelled")]
    Cancelled,

    /// The peer refused the handshake.
    #[error("Peer rejected the handshake: {0}")]
    PeerRejected(String),

    /// An underlying cryptographic operation failed.
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// The transport could not deliver a frame.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The peers share no protocol or transcript version.
    #[error("Version mismatch: local {local}, peer {peer}")]
    VersionMismatch {
        /// Version this side announced or supports.
        local: u8,
        /// Version the peer announced or selected.
        peer: u8,
    },

    /// No mutually acceptable suite, or the selection violated policy.
    #[error("Suite negotiation failed: {0}")]
    SuiteNegotiationFailed(String),

    /// sigA or sigB did not verify.
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// A frame could not be decoded as the expected message.
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// The peer's identity key fingerprint does not match the pinned one.
    #[error("Identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Pinned fingerprint.
        expected: String,
        /// Fingerprint computed from the presented key.
        actual: String,
    },

    /// This (nonce, nonce, suite) tuple was seen before.
    #[error("Replay detected")]
    ReplayDetected,

    /// Policy demands SE-PoP but no enclave key is usable.
    #[error("Secure Enclave proof-of-possession is required but unavailable")]
    SecureEnclavePopRequired,

    /// seSigA/seSigB did not verify against the pinned enclave key.
    #[error("Secure Enclave signature invalid")]
    SecureEnclaveSignatureInvalid,

    /// The peer's FINISHED MAC did not verify.
    #[error("Key confirmation failed")]
    KeyConfirmationFailed,

    /// MessageB selected a suite from the wrong family for sigA.
    #[error("Suite {selected_suite} is incompatible with signature algorithm {sig_a_algorithm}")]
    SuiteSignatureMismatch {
        /// Suite the responder selected.
        selected_suite: CipherSuite,
        /// Algorithm MessageA was signed with.
        sig_a_algorithm: SignatureAlgorithm,
    },

    /// No PQC provider is available for a PQC-only attempt.
    #[error("PQC provider unavailable")]
    PqcProviderUnavailable,

    /// A required suite (or suite family) is not supported.
    #[error("Suite not supported: {0}")]
    SuiteNotSupported(String),

    /// The offered-suite list resolved to nothing at initialization.
    #[error("Offered suite list is empty ({strategy})")]
    EmptyOfferedSuites {
        /// Strategy whose filter produced the empty list.
        strategy: &'static str,
    },

    /// The offered-suite list mixes PQC-group and classical suites.
    #[error("Offered suites mix PQC-group and classical members")]
    HomogeneityViolation,

    /// The configured signer does not produce the algorithm the offer needs.
    #[error("Provider algorithm mismatch: offer needs {expected}, provider has {actual}")]
    ProviderAlgorithmMismatch {
        /// Algorithm the offered suites require.
        expected: SignatureAlgorithm,
        /// Algorithm the configured signer produces.
        actual: SignatureAlgorithm,
    },

    /// A message's identity key algorithm contradicts its suite family.
    #[error("Signature algorithm mismatch: expected {expected}, got {actual}")]
    SignatureAlgorithmMismatch {
        /// Algorithm required by the offer's family.
        expected: SignatureAlgorithm,
        /// Algorithm actually presented.
        actual: SignatureAlgorithm,
    },

    /// A key handle's shape cannot back the requested algorithm.
    #[error("Invalid provider type: {0}")]
    InvalidProviderType(String),

    /// An algorithm outside {{ed25519, mldsa65}} was offered for protocol
    /// signing.
    #[error("{0} may not produce protocol signatures")]
    InvalidAlgorithmForProtocolSigning(SignatureAlgorithm),
}

/// UX class of a failure; drives how the product surfaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retryable without user involvement.
    Transient,

    /// Requires user attention (possible impostor).
    Authentication,

    /// Local or peer configuration forbids the handshake.
    Policy,

    /// Protocol-level incompatibility; upgrade required.
    Protocol,
}

impl HandshakeError {
    /// Stable snake_case reason code used in events and metrics.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::AlreadyInProgress => "already_in_progress",
            Self::ContextZeroized => "context_zeroized",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::PeerRejected(_) => "peer_rejected",
            Self::Crypto(_) => "crypto_error",
            Self::Transport(_) => "transport_error",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::SuiteNegotiationFailed(_) => "suite_negotiation_failed",
            Self::SignatureVerificationFailed => "signature_verification_failed",
            Self::InvalidMessageFormat(_) => "invalid_message_format",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::ReplayDetected => "replay_detected",
            Self::SecureEnclavePopRequired => "secure_enclave_pop_required",
            Self::SecureEnclaveSignatureInvalid => "secure_enclave_signature_invalid",
            Self::KeyConfirmationFailed => "key_confirmation_failed",
            Self::SuiteSignatureMismatch { .. } => "suite_signature_mismatch",
            Self::PqcProviderUnavailable => "pqc_provider_unavailable",
            Self::SuiteNotSupported(_) => "suite_not_supported",
            Self::EmptyOfferedSuites { .. } => "empty_offered_suites",
            Self::HomogeneityViolation => "homogeneity_violation",
            Self::ProviderAlgorithmMismatch { .. } => "provider_algorithm_mismatch",
            Self::SignatureAlgorithmMismatch { .. } => "signature_algorithm_mismatch",
            Self::InvalidProviderType(_) => "invalid_provider_type",
            Self::InvalidAlgorithmForProtocolSigning(_) => "invalid_algorithm_for_protocol_signing",
        }
    }

    /// Whether the two-attempt manager may fall back to classical after this
    /// failure.
    ///
    /// The whitelist is exactly these three reasons. Everything else, and in
    /// particular `timeout`, must propagate, otherwise an attacker who can
    /// drop packets could force a downgrade.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::PqcProviderUnavailable
                | Self::SuiteNotSupported(_)
                | Self::SuiteNegotiationFailed(_)
        )
    }

    /// UX classification of this failure.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::Transport(_) | Self::Cancelled | Self::AlreadyInProgress => {
                FailureClass::Transient
            }
            Self::SignatureVerificationFailed
            | Self::IdentityMismatch { .. }
            | Self::SecureEnclaveSignatureInvalid
            | Self::KeyConfirmationFailed
            | Self::ReplayDetected
            | Self::SuiteSignatureMismatch { .. } => FailureClass::Authentication,
            Self::SecureEnclavePopRequired
            | Self::PqcProviderUnavailable
            | Self::SuiteNotSupported(_)
            | Self::SuiteNegotiationFailed(_)
            | Self::EmptyOfferedSuites { .. }
            | Self::HomogeneityViolation
            | Self::ProviderAlgorithmMismatch { .. }
            | Self::SignatureAlgorithmMismatch { .. }
            | Self::InvalidProviderType(_)
            | Self::InvalidAlgorithmForProtocolSigning(_) => FailureClass::Policy,
            Self::VersionMismatch { .. }
            | Self::InvalidMessageFormat(_)
            | Self::PeerRejected(_)
            | Self::Crypto(_)
            | Self::ContextZeroized => FailureClass::Protocol,
        }
    }
}

impl From<skybridge_identity::IdentityError> for HandshakeError {
    fn from(err: skybridge_identity::IdentityError) -> Self {
        match err {
            skybridge_identity::IdentityError::Crypto(inner) => Self::Crypto(inner),
            other => Self::Crypto(CryptoError::InvalidKey(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_whitelist_is_exact() {
        assert!(HandshakeError::PqcProviderUnavailable.is_fallback_eligible());
        assert!(HandshakeError::SuiteNotSupported("no pqc suites".into()).is_fallback_eligible());
        assert!(HandshakeError::SuiteNegotiationFailed("nothing in common".into())
            .is_fallback_eligible());

        // The blacklist, in particular timeout.
        assert!(!HandshakeError::Timeout.is_fallback_eligible());
        assert!(!HandshakeError::SignatureVerificationFailed.is_fallback_eligible());
        assert!(!HandshakeError::ReplayDetected.is_fallback_eligible());
        assert!(!HandshakeError::KeyConfirmationFailed.is_fallback_eligible());
        assert!(!HandshakeError::Cancelled.is_fallback_eligible());
        assert!(!HandshakeError::Transport("refused".into()).is_fallback_eligible());
        assert!(!HandshakeError::SuiteSignatureMismatch {
            selected_suite: CipherSuite::X25519Ed25519,
            sig_a_algorithm: SignatureAlgorithm::MlDsa65,
        }
        .is_fallback_eligible());
    }

    #[test]
    fn reason_codes_are_snake_case() {
        let samples: Vec<HandshakeError> = vec![
            HandshakeError::AlreadyInProgress,
            HandshakeError::Timeout,
            HandshakeError::SecureEnclavePopRequired,
            HandshakeError::HomogeneityViolation,
        ];
        for err in samples {
            let code = err.reason_code();
            assert!(code
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'), "{code}");
        }
    }

    #[test]
    fn failure_classes_match_ux_table() {
        assert_eq!(HandshakeError::Timeout.failure_class(), FailureClass::Transient);
        assert_eq!(
            HandshakeError::SignatureVerificationFailed.failure_class(),
            FailureClass::Authentication
        );
        assert_eq!(
            HandshakeError::SecureEnclavePopRequired.failure_class(),
            FailureClass::Policy
        );
        assert_eq!(
            HandshakeError::VersionMismatch { local: 1, peer: 2 }.failure_class(),
            FailureClass::Protocol
        );
    }
}
