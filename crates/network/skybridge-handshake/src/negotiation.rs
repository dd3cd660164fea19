//! Pre-negotiation signature selection and suite-signature homogeneity.
//!
//! MessageA must be signed before the suite is negotiated, yet the right
//! signature algorithm depends on the suite family. The rule that breaks the
//! cycle: the offered list is homogeneous (all PQC-group or all classical),
//! and its family fixes sigA. The responder may only select a suite from the
//! family sigA belongs to.

use crate::error::{HandshakeError, Result};
use skybridge_core::{HandshakePolicy, SecurityTier};
use skybridge_crypto::{CipherSuite, ProviderRegistry, SignatureAlgorithm};

/// The two offer strategies the two-attempt manager sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStrategy {
    /// Offer only PQC-group suites (pure PQC and hybrid).
    PqcOnly,

    /// Offer only classical suites.
    ClassicOnly,
}

impl OfferStrategy {
    /// Stable name used in downgrade events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PqcOnly => "pqc_only",
            Self::ClassicOnly => "classic_only",
        }
    }
}

/// A validated, possibly empty offered-suite list.
#[derive(Debug, Clone)]
pub struct OfferedSuites {
    /// Strategy that produced the list.
    pub strategy: OfferStrategy,

    /// The suites, preference order.
    pub suites: Vec<CipherSuite>,
}

impl OfferedSuites {
    /// Filters the provider registry's suites by strategy.
    ///
    /// An empty result is returned as-is; the two-attempt layer translates
    /// it into `pqc_provider_unavailable` (or the classical equivalent).
    pub fn build(strategy: OfferStrategy, registry: &ProviderRegistry) -> Self {
        let suites = match strategy {
            OfferStrategy::PqcOnly => registry.pqc_group_suites(),
            OfferStrategy::ClassicOnly => registry.classic_suites(),
        };
        Self { strategy, suites }
    }

    /// Whether the strategy produced no offerable suites.
    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    /// The error an empty offer translates to.
    pub fn empty_error(&self) -> HandshakeError {
        match self.strategy {
            OfferStrategy::PqcOnly => HandshakeError::PqcProviderUnavailable,
            OfferStrategy::ClassicOnly => {
                HandshakeError::SuiteNotSupported("no classical suites available".into())
            }
        }
    }
}

/// Validates homogeneity and derives sigA's algorithm from an offer.
pub fn signature_algorithm_for_offer(suites: &[CipherSuite]) -> Result<SignatureAlgorithm> {
    let Some(first) = suites.first() else {
        return Err(HandshakeError::EmptyOfferedSuites {
            strategy: "unspecified",
        });
    };
    let pqc_group = first.is_pqc_group();
    if suites.iter().any(|s| s.is_pqc_group() != pqc_group) {
        return Err(HandshakeError::HomogeneityViolation);
    }
    Ok(if pqc_group {
        SignatureAlgorithm::MlDsa65
    } else {
        SignatureAlgorithm::Ed25519
    })
}

/// Enforces `selected.is_pqc_group ⇔ sig_a == mldsa65` on MessageB receipt.
pub fn check_suite_signature_compatibility(
    selected: CipherSuite,
    sig_a: SignatureAlgorithm,
) -> Result<()> {
    let compatible = selected.is_pqc_group() == (sig_a == SignatureAlgorithm::MlDsa65);
    if compatible {
        Ok(())
    } else {
        Err(HandshakeError::SuiteSignatureMismatch {
            selected_suite: selected,
            sig_a_algorithm: sig_a,
        })
    }
}

/// Responder-side suite selection.
///
/// Walks the offer in the initiator's preference order and takes the first
/// suite that is sigA-compatible, locally implemented, and acceptable to
/// both the peer's transmitted policy and the local tier floor.
pub fn select_suite(
    offered: &[CipherSuite],
    sig_a: SignatureAlgorithm,
    registry: &ProviderRegistry,
    peer_policy: &HandshakePolicy,
    local_minimum_tier: SecurityTier,
) -> Result<CipherSuite> {
    for &suite in offered {
        if check_suite_signature_compatibility(suite, sig_a).is_err() {
            continue;
        }
        if registry.provider_for_suite(suite).is_err() {
            continue;
        }
        if suite.tier() < peer_policy.minimum_tier || suite.tier() < local_minimum_tier {
            continue;
        }
        if peer_policy.require_pqc && !suite.is_pqc() {
            continue;
        }
        return Ok(suite);
    }
    Err(HandshakeError::SuiteNegotiationFailed(
        "no offered suite is acceptable to this responder".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_algorithm_follows_the_offered_family() {
        assert_eq!(
            signature_algorithm_for_offer(&[CipherSuite::MlKem768MlDsa65, CipherSuite::XWingMlDsa])
                .unwrap(),
            SignatureAlgorithm::MlDsa65
        );
        assert_eq!(
            signature_algorithm_for_offer(&[CipherSuite::X25519Ed25519]).unwrap(),
            SignatureAlgorithm::Ed25519
        );
    }

    #[test]
    fn mixed_offers_violate_homogeneity() {
        assert!(matches!(
            signature_algorithm_for_offer(&[
                CipherSuite::MlKem768MlDsa65,
                CipherSuite::X25519Ed25519
            ]),
            Err(HandshakeError::HomogeneityViolation)
        ));
        assert!(matches!(
            signature_algorithm_for_offer(&[]),
            Err(HandshakeError::EmptyOfferedSuites { .. })
        ));
    }

    #[test]
    fn compatibility_is_biconditional() {
        check_suite_signature_compatibility(
            CipherSuite::MlKem768MlDsa65,
            SignatureAlgorithm::MlDsa65,
        )
        .unwrap();
        check_suite_signature_compatibility(
            CipherSuite::X25519Ed25519,
            SignatureAlgorithm::Ed25519,
        )
        .unwrap();

        assert!(check_suite_signature_compatibility(
            CipherSuite::X25519Ed25519,
            SignatureAlgorithm::MlDsa65
        )
        .is_err());
        assert!(check_suite_signature_compatibility(
            CipherSuite::XWingMlDsa,
            SignatureAlgorithm::Ed25519
        )
        .is_err());
    }

    #[test]
    fn offer_builder_filters_by_strategy() {
        let registry = ProviderRegistry::full();
        let pqc = OfferedSuites::build(OfferStrategy::PqcOnly, &registry);
        assert_eq!(
            pqc.suites,
            vec![CipherSuite::XWingMlDsa, CipherSuite::MlKem768MlDsa65]
        );
        let classic = OfferedSuites::build(OfferStrategy::ClassicOnly, &registry);
        assert_eq!(classic.suites, vec![CipherSuite::X25519Ed25519]);

        let limited = ProviderRegistry::classic_only();
        let empty = OfferedSuites::build(OfferStrategy::PqcOnly, &limited);
        assert!(empty.is_empty());
        assert!(matches!(
            empty.empty_error(),
            HandshakeError::PqcProviderUnavailable
        ));
    }

    #[test]
    fn selection_respects_policy_floors() {
        let registry = ProviderRegistry::full();
        let offered = [CipherSuite::XWingMlDsa, CipherSuite::MlKem768MlDsa65];

        // Tier floor of hybrid rules out the pure-PQC offer.
        let selected = select_suite(
            &offered,
            SignatureAlgorithm::MlDsa65,
            &registry,
            &HandshakePolicy::default(),
            SecurityTier::Hybrid,
        )
        .unwrap();
        assert_eq!(selected, CipherSuite::XWingMlDsa);

        // require_pqc admits only the pure-PQC suite.
        let policy = HandshakePolicy {
            require_pqc: true,
            ..Default::default()
        };
        let selected = select_suite(
            &offered,
            SignatureAlgorithm::MlDsa65,
            &registry,
            &policy,
            SecurityTier::Classic,
        )
        .unwrap();
        assert_eq!(selected, CipherSuite::MlKem768MlDsa65);
    }

    #[test]
    fn selection_fails_when_nothing_is_acceptable() {
        let registry = ProviderRegistry::classic_only();
        let result = select_suite(
            &[CipherSuite::MlKem768MlDsa65],
            SignatureAlgorithm::MlDsa65,
            &registry,
            &HandshakePolicy::default(),
            SecurityTier::Classic,
        );
        assert!(matches!(
            result,
            Err(HandshakeError::SuiteNegotiationFailed(_))
        ));
    }
}
