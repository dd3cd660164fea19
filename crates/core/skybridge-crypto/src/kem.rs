//! KEM primitives per family: X25519-as-KEM, ML-KEM-768 and the X-Wing
//! style hybrid.
//!
//! Every function speaks raw byte slices; the provider layer owns suite
//! dispatch and keypair bookkeeping.

use crate::error::{CryptoError, Result};
use crate::keys::{
    SharedSecret, MLKEM768_CIPHERTEXT_LEN, MLKEM768_PUBLIC_KEY_LEN, MLKEM768_SECRET_KEY_LEN,
    X25519_KEY_LEN, XWING_PUBLIC_KEY_LEN, XWING_SECRET_KEY_LEN,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

/// Domain label for the hybrid shared-secret combiner.
const XWING_COMBINE_INFO: &[u8] = b"SkyBridge-XWing-Combine-v1";

/// X25519 ephemeral Diffie-Hellman packaged as a KEM.
pub mod x25519 {
    use super::*;
    use rand_core::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    /// Generates a fresh keypair.
    pub fn generate_keypair() -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (
            public.as_bytes().to_vec(),
            Zeroizing::new(secret.to_bytes().to_vec()),
        )
    }

    /// Encapsulates to a recipient public key.
    ///
    /// The "ciphertext" is the ephemeral public key; the shared secret is the
    /// DH output.
    pub fn encapsulate(recipient_public: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
        let peer = parse_public(recipient_public)?;
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&peer);
        Ok((
            ephemeral_public.as_bytes().to_vec(),
            Zeroizing::new(shared.as_bytes().to_vec()),
        ))
    }

    /// Recovers the shared secret from an encapsulation.
    pub fn decapsulate(secret_key: &[u8], encapsulated: &[u8]) -> Result<SharedSecret> {
        let secret: [u8; X25519_KEY_LEN] = secret_key.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength {
                algorithm: "x25519",
                expected: "32",
                actual: secret_key.len(),
            }
        })?;
        let peer = parse_public(encapsulated)?;
        let secret = StaticSecret::from(secret);
        let shared = secret.diffie_hellman(&peer);
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }

    fn parse_public(bytes: &[u8]) -> Result<PublicKey> {
        let array: [u8; X25519_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    algorithm: "x25519",
                    expected: "32",
                    actual: bytes.len(),
                })?;
        Ok(PublicKey::from(array))
    }
}

/// ML-KEM-768 (FIPS 203).
pub mod mlkem768 {
    use super::*;
    use pqcrypto_mlkem::mlkem768;
    use pqcrypto_traits::kem::{Ciphertext, PublicKey, SecretKey, SharedSecret as _};

    /// Generates a fresh keypair.
    pub fn generate_keypair() -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let (pk, sk) = mlkem768::keypair();
        (
            pk.as_bytes().to_vec(),
            Zeroizing::new(sk.as_bytes().to_vec()),
        )
    }

    /// Encapsulates to a recipient public key.
    pub fn encapsulate(recipient_public: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
        if recipient_public.len() != MLKEM768_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                algorithm: "mlkem768",
                expected: "1184",
                actual: recipient_public.len(),
            });
        }
        let pk = mlkem768::PublicKey::from_bytes(recipient_public)
            .map_err(|e| CryptoError::Encapsulation(format!("invalid public key: {e:?}")))?;
        let (ss, ct) = mlkem768::encapsulate(&pk);
        Ok((
            ct.as_bytes().to_vec(),
            Zeroizing::new(ss.as_bytes().to_vec()),
        ))
    }

    /// Recovers the shared secret from a ciphertext.
    pub fn decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret> {
        if secret_key.len() != MLKEM768_SECRET_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                algorithm: "mlkem768",
                expected: "2400",
                actual: secret_key.len(),
            });
        }
        if ciphertext.len() != MLKEM768_CIPHERTEXT_LEN {
            return Err(CryptoError::Decapsulation(format!(
                "invalid ciphertext length {}",
                ciphertext.len()
            )));
        }
        let sk = mlkem768::SecretKey::from_bytes(secret_key)
            .map_err(|e| CryptoError::Decapsulation(format!("invalid secret key: {e:?}")))?;
        let ct = mlkem768::Ciphertext::from_bytes(ciphertext)
            .map_err(|e| CryptoError::Decapsulation(format!("invalid ciphertext: {e:?}")))?;
        let ss = mlkem768::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

/// X-Wing style hybrid: X25519 ⊕ ML-KEM-768 with an HKDF-SHA256 combiner.
///
/// Keys and encapsulations are the plain concatenation X25519 ‖ ML-KEM; the
/// final shared secret binds both component secrets and both public inputs.
pub mod xwing {
    use super::*;

    /// Generates a fresh hybrid keypair.
    pub fn generate_keypair() -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let (x_pub, x_sec) = x25519::generate_keypair();
        let (ml_pub, ml_sec) = mlkem768::generate_keypair();

        let mut public = Vec::with_capacity(XWING_PUBLIC_KEY_LEN);
        public.extend_from_slice(&x_pub);
        public.extend_from_slice(&ml_pub);

        let mut secret = Zeroizing::new(Vec::with_capacity(XWING_SECRET_KEY_LEN));
        secret.extend_from_slice(&x_sec);
        secret.extend_from_slice(&ml_sec);

        (public, secret)
    }

    /// Encapsulates to a hybrid public key.
    pub fn encapsulate(recipient_public: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
        if recipient_public.len() != XWING_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                algorithm: "xwing",
                expected: "1216",
                actual: recipient_public.len(),
            });
        }
        let (x_pub, ml_pub) = recipient_public.split_at(X25519_KEY_LEN);

        let (x_ct, x_ss) = x25519::encapsulate(x_pub)?;
        let (ml_ct, ml_ss) = mlkem768::encapsulate(ml_pub)?;

        let combined = combine(&x_ss, &ml_ss, &x_ct, recipient_public)?;

        let mut encapsulated = Vec::with_capacity(x_ct.len() + ml_ct.len());
        encapsulated.extend_from_slice(&x_ct);
        encapsulated.extend_from_slice(&ml_ct);
        Ok((encapsulated, combined))
    }

    /// Recovers the combined shared secret.
    pub fn decapsulate(
        secret_key: &[u8],
        public_key: &[u8],
        encapsulated: &[u8],
    ) -> Result<SharedSecret> {
        if secret_key.len() != XWING_SECRET_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                algorithm: "xwing",
                expected: "2432",
                actual: secret_key.len(),
            });
        }
        if encapsulated.len() != X25519_KEY_LEN + MLKEM768_CIPHERTEXT_LEN {
            return Err(CryptoError::Decapsulation(format!(
                "invalid hybrid encapsulation length {}",
                encapsulated.len()
            )));
        }
        let (x_sec, ml_sec) = secret_key.split_at(X25519_KEY_LEN);
        let (x_ct, ml_ct) = encapsulated.split_at(X25519_KEY_LEN);

        let x_ss = x25519::decapsulate(x_sec, x_ct)?;
        let ml_ss = mlkem768::decapsulate(ml_sec, ml_ct)?;

        combine(&x_ss, &ml_ss, x_ct, public_key)
    }

    /// HKDF combiner over both component secrets plus the transcript-relevant
    /// public inputs, so neither component can be cut out in transit.
    fn combine(
        x_ss: &[u8],
        ml_ss: &[u8],
        x_ciphertext: &[u8],
        recipient_public: &[u8],
    ) -> Result<SharedSecret> {
        let mut ikm = Vec::with_capacity(x_ss.len() + ml_ss.len());
        ikm.extend_from_slice(x_ss);
        ikm.extend_from_slice(ml_ss);

        let mut info = Vec::with_capacity(XWING_COMBINE_INFO.len() + x_ciphertext.len() + recipient_public.len());
        info.extend_from_slice(XWING_COMBINE_INFO);
        info.extend_from_slice(x_ciphertext);
        info.extend_from_slice(recipient_public);

        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut okm = Zeroizing::new(vec![0u8; 32]);
        hk.expand(&info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation("hybrid combiner expansion failed".into()))?;
        ikm.zeroize();
        Ok(okm)
    }
}
