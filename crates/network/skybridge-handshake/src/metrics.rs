//! Handshake metrics collector.

use crate::error::FailureClass;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters recorded by drivers and the two-attempt manager.
#[derive(Debug, Default)]
pub struct HandshakeMetrics {
    initiated: AtomicU64,
    messages_a_sent: AtomicU64,
    established: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    replays_detected: AtomicU64,
    auth_failures: AtomicU64,
    fallbacks: AtomicU64,
    total_duration_us: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Handshakes started (either role).
    pub initiated: u64,
    /// MessageA frames sent.
    pub messages_a_sent: u64,
    /// Handshakes that reached `established`.
    pub established: u64,
    /// Handshakes that reached `failed` (any reason).
    pub failed: u64,
    /// Failures whose reason was `timeout`.
    pub timeouts: u64,
    /// Failures whose reason was `replay_detected`.
    pub replays_detected: u64,
    /// Failures classified as authentication failures.
    pub auth_failures: u64,
    /// PQC → classical fallbacks taken.
    pub fallbacks: u64,
    /// Mean time to `established`, microseconds.
    pub avg_establish_us: u64,
}

impl HandshakeMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a handshake start.
    pub fn record_initiated(&self) {
        self.initiated.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a MessageA send.
    pub fn record_message_a(&self) {
        self.messages_a_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful establishment and its duration.
    pub fn record_established(&self, duration: Duration) {
        self.established.fetch_add(1, Ordering::Relaxed);
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Records a terminal failure.
    pub fn record_failure(&self, reason_code: &str, class: FailureClass) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        match reason_code {
            "timeout" => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            "replay_detected" => {
                self.replays_detected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if class == FailureClass::Authentication {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a strategy fallback.
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshots every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let established = self.established.load(Ordering::Relaxed);
        let total_us = self.total_duration_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            initiated: self.initiated.load(Ordering::Relaxed),
            messages_a_sent: self.messages_a_sent.load(Ordering::Relaxed),
            established,
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            replays_detected: self.replays_detected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            avg_establish_us: if established > 0 {
                total_us / established
            } else {
                0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = HandshakeMetrics::new();
        metrics.record_initiated();
        metrics.record_message_a();
        metrics.record_established(Duration::from_micros(800));
        metrics.record_established(Duration::from_micros(200));
        metrics.record_failure("timeout", FailureClass::Transient);
        metrics.record_failure("replay_detected", FailureClass::Authentication);
        metrics.record_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.initiated, 1);
        assert_eq!(snapshot.established, 2);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.replays_detected, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.avg_establish_us, 500);
    }
}
