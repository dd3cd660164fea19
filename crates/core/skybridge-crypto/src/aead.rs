//! HPKE-style sealed boxes: AES-256-GCM under an HKDF-derived key.

use crate::error::{CryptoError, Result};
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// AEAD nonce length.
pub const NONCE_LEN: usize = 12;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

/// An authenticated, encrypted payload plus the KEM encapsulation that
/// delivered its key.
///
/// `encapsulated_key` is empty when the shared secret traveled out of band
/// (the PQC path, where the KEM share was already in MessageA).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    /// KEM ciphertext or ephemeral public key; possibly empty.
    pub encapsulated_key: Vec<u8>,

    /// Fresh random nonce.
    pub nonce: [u8; NONCE_LEN],

    /// Ciphertext without the tag.
    pub ciphertext: Vec<u8>,

    /// GCM authentication tag.
    pub tag: [u8; TAG_LEN],
}

/// Derives the AEAD key for a sealed box.
fn derive_key(shared_secret: &[u8], salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(info, key.as_mut())
        .map_err(|_| CryptoError::KeyDerivation("sealed-box key expansion failed".into()))?;
    Ok(key)
}

/// Seals a payload under a previously established shared secret.
pub fn seal_with_secret(
    shared_secret: &[u8],
    salt: &[u8],
    info: &[u8],
    plaintext: &[u8],
) -> Result<SealedBox> {
    let key = derive_key(shared_secret, salt, info)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|_| CryptoError::Seal("invalid AEAD key length".into()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut sealed = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| CryptoError::Seal("AEAD encryption failed".into()))?;

    if sealed.len() < TAG_LEN {
        return Err(CryptoError::Seal("AEAD output shorter than tag".into()));
    }
    let tag_offset = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_offset..]);
    sealed.truncate(tag_offset);

    Ok(SealedBox {
        encapsulated_key: Vec::new(),
        nonce,
        ciphertext: sealed,
        tag,
    })
}

/// Opens a sealed box under a previously established shared secret.
pub fn open_with_secret(
    shared_secret: &[u8],
    salt: &[u8],
    info: &[u8],
    sealed: &SealedBox,
) -> Result<Vec<u8>> {
    let key = derive_key(shared_secret, salt, info)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|_| CryptoError::Open("invalid AEAD key length".into()))?;

    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);

    cipher
        .decrypt((&sealed.nonce).into(), combined.as_slice())
        .map_err(|_| CryptoError::Open("authentication failed".into()))
}
