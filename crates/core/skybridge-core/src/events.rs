//! Security events and the sinks that carry them.
//!
//! Events are emitted at a single funnel per subsystem (the handshake
//! driver's failure path, the two-attempt manager, the trust store) rather
//! than at each throw site, so a failure produces exactly one event.

use crate::policy::HandshakePolicy;
use crate::types::DeviceId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A structured security event.
///
/// The variant names map 1:1 to the event names consumed by the product's
/// security pipeline; `name()` returns that stable string and `context()`
/// the ordered key/value pairs each event is required to carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecurityEvent {
    /// A weaker suite or strategy was selected than the strongest offered.
    CryptoDowngrade {
        /// Strongest suite offered (first preference), if suite-level.
        proposed_suite: Option<String>,
        /// Suite the peer selected, if suite-level.
        selected_suite: Option<String>,
        /// Wire id of the proposed suite.
        proposed_wire_id: Option<u16>,
        /// Wire id of the selected suite.
        selected_wire_id: Option<u16>,
        /// Strategy abandoned by the two-attempt manager, if strategy-level.
        from_strategy: Option<String>,
        /// Strategy the two-attempt manager fell back to, if strategy-level.
        to_strategy: Option<String>,
        /// Per-peer fallback cooldown in effect, seconds.
        cooldown_seconds: Option<u64>,
        /// Remaining cooldown when a fallback was refused, seconds.
        cooldown_remaining_seconds: Option<u64>,
        /// Policy in force when the downgrade happened.
        policy: HandshakePolicy,
        /// Why the downgrade was accepted or attempted.
        reason: String,
    },

    /// A handshake reached the terminal failure state.
    HandshakeFailed {
        /// Stable failure reason code.
        reason: String,
        /// Anonymized peer identifier.
        peer: String,
    },

    /// MessageB selected a suite from the wrong family for sigA.
    SignatureAlgorithmMismatch {
        /// The suite the responder selected.
        selected_suite: String,
        /// The signature algorithm MessageA was signed with.
        sig_a_algorithm: String,
        /// Peer device id.
        device_id: String,
    },

    /// A pinned identity was upgraded via dual-signature binding.
    KeyMigrationCompleted {
        /// Algorithm tag of the retired key.
        from_tag: String,
        /// Algorithm tag of the new key.
        to_tag: String,
        /// Which key purpose migrated.
        key_type: String,
    },

    /// A peer authenticated through the legacy P-256 verification path.
    LegacySignatureAccepted {
        /// Algorithm the trust record pins.
        expected_algorithm: String,
        /// Algorithm the peer actually used.
        actual_algorithm: String,
        /// Peer device id.
        device_id: String,
    },

    /// Secure-Enclave PoP state was half-present (key without handle or the
    /// reverse).
    SePopInconsistentState {
        /// Which half was found.
        state: String,
    },
}

impl SecurityEvent {
    /// Stable event name consumed by the security pipeline.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CryptoDowngrade { .. } => "crypto_downgrade",
            Self::HandshakeFailed { .. } => "handshake_failed",
            Self::SignatureAlgorithmMismatch { .. } => "signature_algorithm_mismatch",
            Self::KeyMigrationCompleted { .. } => "key_migration_completed",
            Self::LegacySignatureAccepted { .. } => "legacy_signature_accepted",
            Self::SePopInconsistentState { .. } => "sePoP_inconsistent_state_detected",
        }
    }

    /// Ordered context pairs for this event.
    pub fn context(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::CryptoDowngrade {
                proposed_suite,
                selected_suite,
                proposed_wire_id,
                selected_wire_id,
                from_strategy,
                to_strategy,
                cooldown_seconds,
                cooldown_remaining_seconds,
                policy,
                reason,
            } => {
                let mut ctx = Vec::new();
                if let Some(s) = proposed_suite {
                    ctx.push(("proposed_suite", s.clone()));
                }
                if let Some(s) = selected_suite {
                    ctx.push(("selected_suite", s.clone()));
                }
                if let Some(id) = proposed_wire_id {
                    ctx.push(("proposed_wire_id", format!("{id:#06x}")));
                }
                if let Some(id) = selected_wire_id {
                    ctx.push(("selected_wire_id", format!("{id:#06x}")));
                }
                if let Some(s) = from_strategy {
                    ctx.push(("from_strategy", s.clone()));
                }
                if let Some(s) = to_strategy {
                    ctx.push(("to_strategy", s.clone()));
                }
                if let Some(v) = cooldown_seconds {
                    ctx.push(("cooldown_seconds", v.to_string()));
                }
                if let Some(v) = cooldown_remaining_seconds {
                    ctx.push(("cooldown_remaining_seconds", v.to_string()));
                }
                ctx.push(("policy_require_pqc", policy.require_pqc.to_string()));
                ctx.push((
                    "policy_allow_classic_fallback",
                    policy.allow_classic_fallback.to_string(),
                ));
                ctx.push(("policy_minimum_tier", policy.minimum_tier.to_string()));
                ctx.push((
                    "policy_require_secure_enclave_pop",
                    policy.require_secure_enclave_pop.to_string(),
                ));
                ctx.push(("policy_in_transcript", "1".to_string()));
                ctx.push(("transcript_binding", "1".to_string()));
                ctx.push((
                    "downgrade_resistance",
                    "policy_gate+no_timeout_fallback+rate_limited".to_string(),
                ));
                ctx.push(("reason", reason.clone()));
                ctx
            }
            Self::HandshakeFailed { reason, peer } => {
                vec![("reason", reason.clone()), ("peer", peer.clone())]
            }
            Self::SignatureAlgorithmMismatch {
                selected_suite,
                sig_a_algorithm,
                device_id,
            } => vec![
                ("selected_suite", selected_suite.clone()),
                ("sig_a_algorithm", sig_a_algorithm.clone()),
                ("device_id", device_id.clone()),
            ],
            Self::KeyMigrationCompleted {
                from_tag,
                to_tag,
                key_type,
            } => vec![
                ("from_tag", from_tag.clone()),
                ("to_tag", to_tag.clone()),
                ("key_type", key_type.clone()),
            ],
            Self::LegacySignatureAccepted {
                expected_algorithm,
                actual_algorithm,
                device_id,
            } => vec![
                ("expected_algorithm", expected_algorithm.clone()),
                ("actual_algorithm", actual_algorithm.clone()),
                ("device_id", device_id.clone()),
            ],
            Self::SePopInconsistentState { state } => vec![("state", state.clone())],
        }
    }

    /// Convenience constructor for the handshake failure funnel.
    pub fn handshake_failed(reason: impl Into<String>, peer: &DeviceId) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
            peer: peer.anonymized(),
        }
    }
}

/// Destination for security events.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Sinks must not block for long; heavy consumers
    /// should hand off internally.
    fn emit(&self, event: SecurityEvent);
}

/// Default sink that logs events through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SecurityEvent) {
        let context = event
            .context()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        match &event {
            SecurityEvent::CryptoDowngrade { .. }
            | SecurityEvent::SignatureAlgorithmMismatch { .. }
            | SecurityEvent::SePopInconsistentState { .. } => {
                tracing::warn!(event = event.name(), %context, "security event");
            }
            _ => {
                tracing::info!(event = event.name(), %context, "security event");
            }
        }
    }
}

/// Sink that records events in memory; used by tests and local diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Events with the given name, in emission order.
    pub fn named(&self, name: &str) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Drains all recorded events.
    pub fn take(&self) -> Vec<SecurityEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}
