//! # SkyBridge Handshake
//!
//! Peer-to-peer secure session establishment for SkyBridge devices.
//!
//! Two devices that can exchange byte frames run a two-message protocol
//! (MessageA → MessageB) with an explicit FINISHED key-confirmation step and
//! come out holding a mutually authenticated, forward-secret, directional
//! session-key pair bound to a negotiated cipher suite.
//!
//! ## Layers
//!
//! - [`driver`]: the per-session state machine (timeouts, replay detection,
//!   cancellation, single-resume completion)
//! - [`context`]: the per-session crypto core (ephemeral keys, transcript,
//!   KEM/DEM, signing, zeroization)
//! - [`fallback`]: the two-attempt PQC → classical strategy with per-peer
//!   rate-limited downgrade
//! - [`negotiation`]: pre-negotiation signature selection and offered-suite
//!   homogeneity
//! - [`transcript`] / [`keyschedule`]: canonical transcript encodings and the
//!   directional HKDF key schedule
//! - [`transport`]: the narrow framed-byte adapter the driver consumes
//!
//! Downgrade resistance is enforced three ways: the policy travels inside the
//! transcript, timeouts never trigger fallback, and per-peer fallback is rate
//! limited.

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod fallback;
pub mod keyschedule;
pub mod messages;
pub mod metrics;
pub mod negotiation;
pub mod pinning;
pub mod replay;
pub mod transcript;
pub mod transport;
pub mod wire;

pub use config::HandshakeConfig;
pub use context::{ContextParams, HandshakeContext};
pub use driver::{DriverStateKind, HandshakeDriver};
pub use error::{FailureClass, HandshakeError, Result};
pub use fallback::{
    FallbackRateLimiter, HandshakeOutcome, TwoAttemptConfig, TwoAttemptManager,
};
pub use keyschedule::SessionKeys;
pub use messages::{
    FinishedDirection, HandshakeFinished, HandshakeMessageA, HandshakeMessageB, KeyShare,
    WireIdentityKey,
};
pub use metrics::{HandshakeMetrics, MetricsSnapshot};
pub use negotiation::{OfferStrategy, OfferedSuites};
pub use pinning::{AcceptAllValidator, IdentityValidator, PinningValidator};
pub use replay::ReplayCache;
pub use transcript::{TranscriptBuilder, TranscriptVersion};
pub use transport::{FrameTransport, MemoryTransport};

// The capability set travels inside MessageA/B; re-exported so handshake
// callers never reach into the crypto crate for it.
pub use skybridge_crypto::CryptoCapabilities;
