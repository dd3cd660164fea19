//! Replay detection.
//!
//! Each accepted handshake message registers a handshake id derived from the
//! nonce pair and the negotiated suite. The cache is process-wide, async-safe
//! and bounded by a sliding window that outlives the maximum handshake
//! timeout.

use crate::config::DEFAULT_REPLAY_WINDOW;
use crate::error::{HandshakeError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use skybridge_crypto::CipherSuite;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag mixed into ids registered at MessageA reception.
pub const REPLAY_TAG_MESSAGE_A: u8 = 0xA1;
/// Tag mixed into ids registered at MessageB reception.
pub const REPLAY_TAG_MESSAGE_B: u8 = 0xB1;

static GLOBAL_CACHE: Lazy<Arc<ReplayCache>> =
    Lazy::new(|| Arc::new(ReplayCache::new(DEFAULT_REPLAY_WINDOW)));

/// Computes the handshake id registered against the replay cache.
///
/// At MessageA reception the responder nonce does not exist yet, so callers
/// pass `None` and an all-zero placeholder is bound instead.
pub fn handshake_id(
    tag: u8,
    initiator_nonce: &[u8; 32],
    responder_nonce: Option<&[u8; 32]>,
    suite: CipherSuite,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(initiator_nonce);
    hasher.update(responder_nonce.unwrap_or(&[0u8; 32]));
    hasher.update(suite.wire_id().to_le_bytes());
    hasher.finalize().into()
}

struct CacheInner {
    seen: HashSet<[u8; 32]>,
    order: VecDeque<(Instant, [u8; 32])>,
}

/// Sliding-window set of observed handshake ids.
pub struct ReplayCache {
    inner: Mutex<CacheInner>,
    window: Duration,
}

impl ReplayCache {
    /// Creates a cache with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            window,
        }
    }

    /// The process-wide cache drivers use by default.
    pub fn global() -> Arc<ReplayCache> {
        GLOBAL_CACHE.clone()
    }

    /// Registers an id, failing when it was already seen inside the window.
    pub fn register(&self, id: [u8; 32]) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        while let Some((stamp, _)) = inner.order.front() {
            if now.duration_since(*stamp) <= self.window {
                break;
            }
            let (_, expired) = inner.order.pop_front().expect("front checked");
            inner.seen.remove(&expired);
        }

        if !inner.seen.insert(id) {
            return Err(HandshakeError::ReplayDetected);
        }
        inner.order.push_back((now, id));
        Ok(())
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let cache = ReplayCache::new(Duration::from_secs(60));
        let id = handshake_id(
            REPLAY_TAG_MESSAGE_A,
            &[1u8; 32],
            None,
            CipherSuite::MlKem768MlDsa65,
        );
        cache.register(id).unwrap();
        assert!(matches!(
            cache.register(id),
            Err(HandshakeError::ReplayDetected)
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn tags_and_nonces_separate_ids() {
        let nonce_i = [1u8; 32];
        let nonce_r = [2u8; 32];
        let a = handshake_id(REPLAY_TAG_MESSAGE_A, &nonce_i, None, CipherSuite::X25519Ed25519);
        let b = handshake_id(
            REPLAY_TAG_MESSAGE_B,
            &nonce_i,
            Some(&nonce_r),
            CipherSuite::X25519Ed25519,
        );
        let c = handshake_id(REPLAY_TAG_MESSAGE_A, &nonce_i, None, CipherSuite::MlKem768MlDsa65);
        assert_ne!(a, b);
        assert_ne!(a, c);

        let cache = ReplayCache::new(Duration::from_secs(60));
        cache.register(a).unwrap();
        cache.register(b).unwrap();
        cache.register(c).unwrap();
    }

    #[test]
    fn expired_entries_are_evicted() {
        let cache = ReplayCache::new(Duration::from_millis(20));
        let id = handshake_id(REPLAY_TAG_MESSAGE_A, &[7u8; 32], None, CipherSuite::X25519Ed25519);
        cache.register(id).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        // Same tuple is accepted again once outside the window.
        cache.register(id).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn global_cache_is_shared() {
        assert!(Arc::ptr_eq(&ReplayCache::global(), &ReplayCache::global()));
    }
}
