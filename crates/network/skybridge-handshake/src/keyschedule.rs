//! The directional key schedule and FINISHED MAC.
//!
//! ```text
//! kdf_info = "SkyBridge-KDF" || suite_wire_id_le || transcriptA || transcriptB
//!            || client_nonce || server_nonce
//! salt     = SHA256("SkyBridge-KDF-Salt-v1|" || kdf_info)
//! send/receive = HKDF-SHA256(ikm=shared_secret, salt, info=kdf_info || dir, 32)
//! ```
//!
//! The initiator's send key equals the responder's receive key (I2R) and
//! vice versa (R2I). The FINISHED MAC for a direction is keyed off that
//! direction's key, so each side proves possession of the key the other
//! side will receive with.

use crate::error::{HandshakeError, Result};
use crate::messages::FinishedDirection;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use skybridge_core::Role;
use skybridge_crypto::CipherSuite;
use uuid::Uuid;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const KDF_LABEL: &[u8] = b"SkyBridge-KDF";
const KDF_SALT_LABEL: &[u8] = b"SkyBridge-KDF-Salt-v1|";
const I2R_LABEL: &[u8] = b"handshake|initiator_to_responder";
const R2I_LABEL: &[u8] = b"handshake|responder_to_initiator";
const FINISHED_LABEL: &[u8] = b"SkyBridge-FINISHED|";

/// The outcome of a successful handshake: directional keys bound to the
/// negotiated suite and transcript.
#[derive(Clone)]
pub struct SessionKeys {
    /// Key protecting traffic this side sends.
    pub send_key: Zeroizing<[u8; 32]>,

    /// Key protecting traffic this side receives.
    pub receive_key: Zeroizing<[u8; 32]>,

    /// The negotiated suite.
    pub negotiated_suite: CipherSuite,

    /// Role this side played.
    pub role: Role,

    /// Final transcript hash, identical on both sides.
    pub transcript_hash: [u8; 32],

    /// Local session identifier.
    pub session_id: Uuid,

    /// Wall-clock creation stamp (informational only).
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("negotiated_suite", &self.negotiated_suite)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("transcript_hash", &hex::encode(self.transcript_hash))
            .finish()
    }
}

/// Derives the directional session keys.
#[allow(clippy::too_many_arguments)]
pub fn derive_session_keys(
    role: Role,
    suite: CipherSuite,
    shared_secret: &[u8],
    transcript_a: &[u8; 32],
    transcript_b: &[u8; 32],
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
) -> Result<SessionKeys> {
    let mut kdf_info = KDF_LABEL.to_vec();
    kdf_info.extend_from_slice(&suite.wire_id().to_le_bytes());
    kdf_info.extend_from_slice(transcript_a);
    kdf_info.extend_from_slice(transcript_b);
    kdf_info.extend_from_slice(client_nonce);
    kdf_info.extend_from_slice(server_nonce);

    let mut salt_input = KDF_SALT_LABEL.to_vec();
    salt_input.extend_from_slice(&kdf_info);
    let salt: [u8; 32] = Sha256::digest(&salt_input).into();

    let mut i2r_info = kdf_info.clone();
    i2r_info.extend_from_slice(I2R_LABEL);
    let mut r2i_info = kdf_info;
    r2i_info.extend_from_slice(R2I_LABEL);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut i2r_key = Zeroizing::new([0u8; 32]);
    hk.expand(&i2r_info, i2r_key.as_mut())
        .map_err(|_| HandshakeError::Crypto(skybridge_crypto::CryptoError::KeyDerivation(
            "I2R key expansion failed".into(),
        )))?;
    let mut r2i_key = Zeroizing::new([0u8; 32]);
    hk.expand(&r2i_info, r2i_key.as_mut())
        .map_err(|_| HandshakeError::Crypto(skybridge_crypto::CryptoError::KeyDerivation(
            "R2I key expansion failed".into(),
        )))?;

    let mut final_input = Vec::with_capacity(64);
    final_input.extend_from_slice(transcript_a);
    final_input.extend_from_slice(transcript_b);
    let transcript_hash: [u8; 32] = Sha256::digest(&final_input).into();

    let (send_key, receive_key) = match role {
        Role::Initiator => (i2r_key, r2i_key),
        Role::Responder => (r2i_key, i2r_key),
    };

    Ok(SessionKeys {
        send_key,
        receive_key,
        negotiated_suite: suite,
        role,
        transcript_hash,
        session_id: Uuid::new_v4(),
        created_at: Utc::now(),
    })
}

impl SessionKeys {
    /// The directional key for a FINISHED direction, from this side's
    /// perspective.
    fn key_for_direction(&self, direction: FinishedDirection) -> &[u8; 32] {
        let own_send = match self.role {
            Role::Initiator => FinishedDirection::InitiatorToResponder,
            Role::Responder => FinishedDirection::ResponderToInitiator,
        };
        if direction == own_send {
            &self.send_key
        } else {
            &self.receive_key
        }
    }

    /// Computes the FINISHED MAC for a direction.
    pub fn finished_mac(&self, direction: FinishedDirection) -> Result<[u8; 32]> {
        let base_key = self.key_for_direction(direction);

        let mut info = FINISHED_LABEL.to_vec();
        info.extend_from_slice(direction.label().as_bytes());
        info.push(b'|');
        info.extend_from_slice(&self.transcript_hash);

        let hk = Hkdf::<Sha256>::new(None, base_key);
        let mut mac_key = Zeroizing::new([0u8; 32]);
        hk.expand(&info, mac_key.as_mut()).map_err(|_| {
            HandshakeError::Crypto(skybridge_crypto::CryptoError::KeyDerivation(
                "FINISHED mac key expansion failed".into(),
            ))
        })?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key.as_ref())
            .expect("hmac accepts any key length");
        mac.update(&self.transcript_hash);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Verifies a peer's FINISHED MAC in constant time.
    pub fn verify_finished_mac(
        &self,
        direction: FinishedDirection,
        mac: &[u8; 32],
    ) -> Result<()> {
        let expected = self.finished_mac(direction)?;
        if constant_time_eq(&expected, mac) {
            Ok(())
        } else {
            Err(HandshakeError::KeyConfirmationFailed)
        }
    }

    /// Seals application bytes under the send key.
    ///
    /// Output is `nonce || ciphertext || tag`; the channel above supplies
    /// framing and replay protection.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(self.send_key.as_ref())
            .expect("send key is 32 bytes");
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher.encrypt((&nonce).into(), plaintext).map_err(|_| {
            HandshakeError::Crypto(skybridge_crypto::CryptoError::Seal(
                "session seal failed".into(),
            ))
        })?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens bytes sealed by the peer under this side's receive key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 12 {
            return Err(HandshakeError::InvalidMessageFormat(
                "sealed payload shorter than nonce".into(),
            ));
        }
        let (nonce, ciphertext) = sealed.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(self.receive_key.as_ref())
            .expect("receive key is 32 bytes");
        cipher.decrypt(nonce.into(), ciphertext).map_err(|_| {
            HandshakeError::Crypto(skybridge_crypto::CryptoError::Open(
                "session open failed".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive_pair() -> (SessionKeys, SessionKeys) {
        let shared_secret = [0x55u8; 32];
        let transcript_a = [0x0A; 32];
        let transcript_b = [0x0B; 32];
        let client_nonce = [0x1C; 32];
        let server_nonce = [0x2D; 32];
        let initiator = derive_session_keys(
            Role::Initiator,
            CipherSuite::MlKem768MlDsa65,
            &shared_secret,
            &transcript_a,
            &transcript_b,
            &client_nonce,
            &server_nonce,
        )
        .unwrap();
        let responder = derive_session_keys(
            Role::Responder,
            CipherSuite::MlKem768MlDsa65,
            &shared_secret,
            &transcript_a,
            &transcript_b,
            &client_nonce,
            &server_nonce,
        )
        .unwrap();
        (initiator, responder)
    }

    #[test]
    fn directional_keys_cross_over() {
        let (initiator, responder) = derive_pair();
        assert_eq!(*initiator.send_key, *responder.receive_key);
        assert_eq!(*initiator.receive_key, *responder.send_key);
        assert_ne!(*initiator.send_key, *initiator.receive_key);
        assert_eq!(initiator.transcript_hash, responder.transcript_hash);
    }

    #[test]
    fn suite_id_is_bound_into_the_schedule() {
        let shared_secret = [0x55u8; 32];
        let a = derive_session_keys(
            Role::Initiator,
            CipherSuite::MlKem768MlDsa65,
            &shared_secret,
            &[0; 32],
            &[0; 32],
            &[0; 32],
            &[0; 32],
        )
        .unwrap();
        let b = derive_session_keys(
            Role::Initiator,
            CipherSuite::X25519Ed25519,
            &shared_secret,
            &[0; 32],
            &[0; 32],
            &[0; 32],
            &[0; 32],
        )
        .unwrap();
        assert_ne!(*a.send_key, *b.send_key);
    }

    #[test]
    fn finished_macs_verify_across_sides() {
        let (initiator, responder) = derive_pair();

        let r2i = responder
            .finished_mac(FinishedDirection::ResponderToInitiator)
            .unwrap();
        initiator
            .verify_finished_mac(FinishedDirection::ResponderToInitiator, &r2i)
            .unwrap();

        let i2r = initiator
            .finished_mac(FinishedDirection::InitiatorToResponder)
            .unwrap();
        responder
            .verify_finished_mac(FinishedDirection::InitiatorToResponder, &i2r)
            .unwrap();

        // Directions are not interchangeable.
        assert!(initiator
            .verify_finished_mac(FinishedDirection::InitiatorToResponder, &r2i)
            .is_err());
    }

    #[test]
    fn tampered_finished_mac_is_rejected() {
        let (initiator, responder) = derive_pair();
        let mut mac = responder
            .finished_mac(FinishedDirection::ResponderToInitiator)
            .unwrap();
        mac[0] ^= 0x01;
        assert!(matches!(
            initiator.verify_finished_mac(FinishedDirection::ResponderToInitiator, &mac),
            Err(HandshakeError::KeyConfirmationFailed)
        ));
    }

    #[test]
    fn session_seal_opens_under_peer_receive_key() {
        let (initiator, responder) = derive_pair();
        let sealed = initiator.seal(b"file-channel hello").unwrap();
        assert_eq!(responder.open(&sealed).unwrap(), b"file-channel hello");

        let sealed_back = responder.seal(b"ack").unwrap();
        assert_eq!(initiator.open(&sealed_back).unwrap(), b"ack");

        // Tampering is caught by the tag.
        let mut bad = initiator.seal(b"payload").unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        assert!(responder.open(&bad).is_err());
    }
}
