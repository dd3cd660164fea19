//! Handshake configuration.

use crate::error::{HandshakeError, Result};
use crate::transcript::TranscriptVersion;
use crate::transport::MAX_FRAME_LEN;
use std::time::Duration;

/// Hard ceiling on the handshake timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Default handshake timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tolerance the steady-clock timer is allowed to fire late by.
pub const TIMER_TOLERANCE: Duration = Duration::from_millis(100);

/// Default per-peer fallback cooldown.
pub const DEFAULT_FALLBACK_COOLDOWN: Duration = Duration::from_secs(300);

/// Default replay-cache window. Must cover at least one maximum timeout.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Tunables for a handshake driver.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long to wait for the peer before failing with `timeout`.
    /// Clamped to [`MAX_TIMEOUT`].
    pub timeout: Duration,

    /// Transcript encodings this device supports, preference order. The
    /// last entry is announced in MessageA.
    pub transcript_versions: Vec<TranscriptVersion>,

    /// Sliding window of the replay cache.
    pub replay_window: Duration,

    /// Per-peer cooldown between PQC → classical fallbacks.
    pub fallback_cooldown: Duration,

    /// Pad every outbound payload to a multiple of this size before
    /// framing. `None` disables traffic padding. Consumed by the transport
    /// adapter; padding is applied and stripped at that boundary only.
    pub padding_boundary: Option<usize>,
}

impl HandshakeConfig {
    /// Timeout with the ceiling applied.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.min(MAX_TIMEOUT)
    }

    /// Highest transcript version this device supports.
    pub fn announced_transcript_version(&self) -> TranscriptVersion {
        self.transcript_versions
            .iter()
            .copied()
            .max()
            .unwrap_or(TranscriptVersion::V1)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(HandshakeError::InvalidProviderType(
                "handshake timeout must be non-zero".into(),
            ));
        }
        if self.transcript_versions.is_empty() {
            return Err(HandshakeError::InvalidProviderType(
                "at least one transcript version must be supported".into(),
            ));
        }
        if self.replay_window < MAX_TIMEOUT {
            return Err(HandshakeError::InvalidProviderType(
                "replay window must cover at least one maximum timeout".into(),
            ));
        }
        if let Some(boundary) = self.padding_boundary {
            if boundary == 0 || boundary > MAX_FRAME_LEN {
                return Err(HandshakeError::InvalidProviderType(format!(
                    "padding boundary must be in 1..={MAX_FRAME_LEN}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            // V2 is implemented and tested; V1 remains the announced default
            // until the fleet has upgraded.
            transcript_versions: vec![TranscriptVersion::V1],
            replay_window: DEFAULT_REPLAY_WINDOW,
            fallback_cooldown: DEFAULT_FALLBACK_COOLDOWN,
            padding_boundary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HandshakeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.effective_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.announced_transcript_version(), TranscriptVersion::V1);
    }

    #[test]
    fn timeout_is_clamped() {
        let config = HandshakeConfig {
            timeout: Duration::from_secs(600),
            ..Default::default()
        };
        assert_eq!(config.effective_timeout(), MAX_TIMEOUT);
    }

    #[test]
    fn v2_support_raises_announcement() {
        let config = HandshakeConfig {
            transcript_versions: vec![TranscriptVersion::V1, TranscriptVersion::V2],
            ..Default::default()
        };
        assert_eq!(config.announced_transcript_version(), TranscriptVersion::V2);
    }

    #[test]
    fn short_replay_window_is_rejected() {
        let config = HandshakeConfig {
            replay_window: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn padding_boundary_is_validated() {
        let config = HandshakeConfig {
            padding_boundary: Some(256),
            ..Default::default()
        };
        config.validate().unwrap();

        for bad in [0, MAX_FRAME_LEN + 1] {
            let config = HandshakeConfig {
                padding_boundary: Some(bad),
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }
}
