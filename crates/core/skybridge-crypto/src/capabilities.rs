//! Advertised cryptographic capabilities.

use crate::error::{CryptoError, Result};
use crate::suite::{AeadAlgorithm, KemAlgorithm, SignatureAlgorithm};
use serde::{Deserialize, Serialize};

/// The set of algorithms a device supports, exchanged during the handshake.
///
/// The encoding is deterministic: codes are sorted and de-duplicated before
/// serialization, so equal capability sets always produce identical bytes
/// (they are bound into the transcript).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoCapabilities {
    /// Supported KEM algorithms.
    pub kems: Vec<KemAlgorithm>,

    /// Supported signature algorithms.
    pub signatures: Vec<SignatureAlgorithm>,

    /// Supported AEAD algorithms.
    pub aeads: Vec<AeadAlgorithm>,

    /// Whether a PQC provider is available on this device.
    pub pqc_available: bool,
}

impl CryptoCapabilities {
    /// Capabilities of a device with the full provider registry.
    pub fn full() -> Self {
        Self {
            kems: vec![
                KemAlgorithm::X25519,
                KemAlgorithm::MlKem768,
                KemAlgorithm::XWingMlKem768,
            ],
            signatures: vec![
                SignatureAlgorithm::Ed25519,
                SignatureAlgorithm::MlDsa65,
                SignatureAlgorithm::P256Ecdsa,
            ],
            aeads: vec![AeadAlgorithm::Aes256Gcm],
            pqc_available: true,
        }
    }

    /// Capabilities of a classical-only device.
    pub fn classic_only() -> Self {
        Self {
            kems: vec![KemAlgorithm::X25519],
            signatures: vec![SignatureAlgorithm::Ed25519, SignatureAlgorithm::P256Ecdsa],
            aeads: vec![AeadAlgorithm::Aes256Gcm],
            pqc_available: false,
        }
    }

    /// Deterministic canonical encoding.
    pub fn deterministic_bytes(&self) -> Vec<u8> {
        let mut kems: Vec<u16> = self.kems.iter().map(|k| k.wire_code()).collect();
        let mut sigs: Vec<u16> = self.signatures.iter().map(|s| s.wire_code()).collect();
        let mut aeads: Vec<u16> = self.aeads.iter().map(|a| a.wire_code()).collect();
        for list in [&mut kems, &mut sigs, &mut aeads] {
            list.sort_unstable();
            list.dedup();
        }

        let mut out = Vec::with_capacity(7 + 2 * (kems.len() + sigs.len() + aeads.len()));
        for list in [&kems, &sigs, &aeads] {
            out.extend_from_slice(&(list.len() as u16).to_be_bytes());
            for code in list.iter() {
                out.extend_from_slice(&code.to_be_bytes());
            }
        }
        out.push(self.pqc_available as u8);
        out
    }

    /// Decodes the canonical encoding.
    pub fn from_deterministic_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let mut read_u16 = |bytes: &[u8], cursor: &mut usize| -> Result<u16> {
            if bytes.len() < *cursor + 2 {
                return Err(CryptoError::InvalidKey(
                    "truncated capabilities encoding".into(),
                ));
            }
            let value = u16::from_be_bytes([bytes[*cursor], bytes[*cursor + 1]]);
            *cursor += 2;
            Ok(value)
        };

        let mut read_list = |bytes: &[u8], cursor: &mut usize| -> Result<Vec<u16>> {
            let count = read_u16(bytes, cursor)? as usize;
            let mut codes = Vec::with_capacity(count);
            for _ in 0..count {
                codes.push(read_u16(bytes, cursor)?);
            }
            Ok(codes)
        };

        let kems = read_list(bytes, &mut cursor)?
            .into_iter()
            .map(KemAlgorithm::from_wire_code)
            .collect::<Result<Vec<_>>>()?;
        let signatures = read_list(bytes, &mut cursor)?
            .into_iter()
            .map(SignatureAlgorithm::from_wire_code)
            .collect::<Result<Vec<_>>>()?;
        let aeads = read_list(bytes, &mut cursor)?
            .into_iter()
            .map(AeadAlgorithm::from_wire_code)
            .collect::<Result<Vec<_>>>()?;

        if bytes.len() != cursor + 1 {
            return Err(CryptoError::InvalidKey(
                "capabilities encoding has trailing bytes".into(),
            ));
        }
        let pqc_available = match bytes[cursor] {
            0 => false,
            1 => true,
            other => {
                return Err(CryptoError::InvalidKey(format!(
                    "invalid pqc_available byte {other:#04x}"
                )))
            }
        };

        Ok(Self {
            kems,
            signatures,
            aeads,
            pqc_available,
        })
    }
}
