//! Handshake wire messages and their signature preimages.

use crate::error::{HandshakeError, Result};
use crate::wire::{WireReader, WireWriter};
use skybridge_core::HandshakePolicy;
use skybridge_crypto::aead::{NONCE_LEN, TAG_LEN};
use skybridge_crypto::{CipherSuite, CryptoCapabilities, SealedBox, SignatureAlgorithm};

/// Domain-separation tag for sigA.
pub const SIG_A_TAG: &[u8] = b"SkyBridge-SigA";
/// Domain-separation tag for sigB.
pub const SIG_B_TAG: &[u8] = b"SkyBridge-SigB";
/// Domain-separation tag for seSigA.
pub const SE_SIG_A_TAG: &[u8] = b"SkyBridge-SeSigA";
/// Domain-separation tag for seSigB.
pub const SE_SIG_B_TAG: &[u8] = b"SkyBridge-SeSigB";

/// Wire magic prefixed to FINISHED frames.
pub const FINISHED_MAGIC: &[u8; 4] = b"FIN1";

/// Nonce length for both sides.
pub const NONCE_BYTES: usize = 32;

const MAX_SUITES: usize = 8;
const MAX_KEY_SHARES: usize = 2;

/// A peer's identity public key as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireIdentityKey {
    /// Protocol signing algorithm of the key.
    pub algorithm: SignatureAlgorithm,

    /// The protocol signing public key.
    pub public_key: Vec<u8>,

    /// Secure-Enclave PoP public key, when the device has one.
    pub se_pop_public_key: Option<Vec<u8>>,
}

impl WireIdentityKey {
    fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.put_u16(self.algorithm.wire_code());
        writer.put_bytes(&self.public_key);
        match &self.se_pop_public_key {
            Some(key) => writer.put_bytes(key),
            None => writer.put_u32(0),
        }
        writer.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let code = reader.read_u16("identity algorithm")?;
        let algorithm = SignatureAlgorithm::from_wire_code(code)
            .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?;
        if !algorithm.is_protocol_signing() {
            // p256_ecdsa must never appear as a protocol signature algorithm
            // on the wire.
            return Err(HandshakeError::InvalidMessageFormat(format!(
                "{algorithm} is not a wire identity algorithm"
            )));
        }
        let public_key = reader.read_bytes("identity public key")?.to_vec();
        let se_pop = reader.read_bytes("se-pop public key")?;
        let se_pop_public_key = if se_pop.is_empty() {
            None
        } else {
            Some(se_pop.to_vec())
        };
        reader.expect_end("identity public key")?;
        Ok(Self {
            algorithm,
            public_key,
            se_pop_public_key,
        })
    }
}

/// One offered key share: a suite plus its KEM material.
///
/// For PQC-group suites the share is the KEM encapsulation to the peer's
/// identity KEM key; for classical suites it is a fresh ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    /// Suite this share belongs to.
    pub suite: CipherSuite,

    /// Encapsulation or ephemeral public key.
    pub share: Vec<u8>,
}

/// Initiator → responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessageA {
    /// Announced protocol / transcript version.
    pub version: u8,

    /// Offered suites, preference order. Non-empty, homogeneous.
    pub supported_suites: Vec<CipherSuite>,

    /// Key shares for a subset of the offered suites.
    pub key_shares: Vec<KeyShare>,

    /// Initiator nonce.
    pub client_nonce: [u8; NONCE_BYTES],

    /// Downgrade-resistance policy, bound into the transcript.
    pub policy: HandshakePolicy,

    /// Initiator capabilities.
    pub capabilities: CryptoCapabilities,

    /// Initiator identity public key.
    pub identity_key: WireIdentityKey,

    /// sigA over the signature preimage.
    pub signature: Vec<u8>,

    /// seSigA, when SE-PoP is active.
    pub se_signature: Option<Vec<u8>>,
}

impl HandshakeMessageA {
    fn encode_authenticated(&self, writer: &mut WireWriter) {
        writer.put_u8(self.version);
        writer.put_u16(self.supported_suites.len() as u16);
        for suite in &self.supported_suites {
            writer.put_u16(suite.wire_id());
        }
        writer.put_u16(self.key_shares.len() as u16);
        for share in &self.key_shares {
            writer.put_u16(share.suite.wire_id());
            writer.put_bytes(&share.share);
        }
        writer.put_fixed(&self.client_nonce);
        writer.put_fixed(&self.policy.canonical_bytes());
        writer.put_bytes(&self.capabilities.deterministic_bytes());
        writer.put_bytes(&self.identity_key.encode());
    }

    /// The authenticated fields in declared order.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.encode_authenticated(&mut writer);
        writer.into_bytes()
    }

    /// Preimage sigA is computed over.
    pub fn signature_preimage(&self) -> Vec<u8> {
        let mut preimage = SIG_A_TAG.to_vec();
        preimage.extend_from_slice(&self.authenticated_bytes());
        preimage
    }

    /// Preimage seSigA is computed over.
    pub fn se_signature_preimage(&self) -> Vec<u8> {
        let mut preimage = SE_SIG_A_TAG.to_vec();
        preimage.extend_from_slice(&self.authenticated_bytes());
        preimage
    }

    /// Canonical wire encoding. Also the bytes transcriptA hashes.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.encode_authenticated(&mut writer);
        writer.put_bytes(&self.signature);
        match &self.se_signature {
            Some(sig) => writer.put_bytes(sig),
            None => writer.put_u32(0),
        }
        writer.into_bytes()
    }

    /// Decodes and structurally validates a MessageA.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let version = reader.read_u8("version")?;

        let suite_count = reader.read_u16("suite count")? as usize;
        if suite_count == 0 || suite_count > MAX_SUITES {
            return Err(HandshakeError::InvalidMessageFormat(format!(
                "suite count {suite_count} outside 1..={MAX_SUITES}"
            )));
        }
        let mut supported_suites = Vec::with_capacity(suite_count);
        for _ in 0..suite_count {
            let id = reader.read_u16("suite id")?;
            supported_suites.push(
                CipherSuite::from_wire_id(id)
                    .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?,
            );
        }

        let share_count = reader.read_u16("key share count")? as usize;
        if share_count == 0 || share_count > MAX_KEY_SHARES {
            return Err(HandshakeError::InvalidMessageFormat(format!(
                "key share count {share_count} outside 1..={MAX_KEY_SHARES}"
            )));
        }
        let mut key_shares = Vec::with_capacity(share_count);
        for _ in 0..share_count {
            let id = reader.read_u16("key share suite")?;
            let suite = CipherSuite::from_wire_id(id)
                .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?;
            let share = reader.read_bytes("key share")?.to_vec();
            key_shares.push(KeyShare { suite, share });
        }

        let client_nonce: [u8; NONCE_BYTES] = reader
            .read_fixed(NONCE_BYTES, "client nonce")?
            .try_into()
            .expect("fixed length read");
        let policy_bytes = reader.read_fixed(HandshakePolicy::WIRE_LEN, "policy")?;
        let policy = HandshakePolicy::from_canonical_bytes(policy_bytes)
            .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?;
        let capabilities =
            CryptoCapabilities::from_deterministic_bytes(reader.read_bytes("capabilities")?)
                .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?;
        let identity_key = WireIdentityKey::decode(reader.read_bytes("identity key")?)?;
        let signature = reader.read_bytes("signature")?.to_vec();
        if signature.is_empty() {
            return Err(HandshakeError::InvalidMessageFormat(
                "empty signature".into(),
            ));
        }
        let se_sig = reader.read_bytes("se signature")?;
        let se_signature = if se_sig.is_empty() {
            None
        } else {
            Some(se_sig.to_vec())
        };
        reader.expect_end("MessageA")?;

        Ok(Self {
            version,
            supported_suites,
            key_shares,
            client_nonce,
            policy,
            capabilities,
            identity_key,
            signature,
            se_signature,
        })
    }
}

/// Responder → initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessageB {
    /// Selected protocol / transcript version; must equal MessageA's.
    pub version: u8,

    /// The suite the responder selected.
    pub selected_suite: CipherSuite,

    /// KEM encapsulation for the classical path; empty for the PQC path
    /// (the share already traveled in MessageA).
    pub responder_share: Vec<u8>,

    /// Responder nonce.
    pub server_nonce: [u8; NONCE_BYTES],

    /// HPKE-style sealed box carrying the responder's capabilities.
    pub encrypted_payload: SealedBox,

    /// sigB over the transcript-bound preimage.
    pub signature: Vec<u8>,

    /// Responder identity public key.
    pub identity_key: WireIdentityKey,

    /// seSigB, when SE-PoP is active.
    pub se_signature: Option<Vec<u8>>,
}

impl HandshakeMessageB {
    fn encode_authenticated(&self, writer: &mut WireWriter) {
        writer.put_u8(self.version);
        writer.put_u16(self.selected_suite.wire_id());
        writer.put_bytes(&self.responder_share);
        writer.put_fixed(&self.server_nonce);
        writer.put_bytes(&self.encrypted_payload.encapsulated_key);
        writer.put_fixed(&self.encrypted_payload.nonce);
        writer.put_bytes(&self.encrypted_payload.ciphertext);
        writer.put_fixed(&self.encrypted_payload.tag);
        writer.put_bytes(&self.identity_key.encode());
    }

    /// The authenticated fields in declared order (identity key included,
    /// signatures excluded).
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.encode_authenticated(&mut writer);
        writer.into_bytes()
    }

    /// Preimage sigB is computed over; bound to transcriptA.
    pub fn signature_preimage(&self, transcript_a: &[u8; 32]) -> Vec<u8> {
        let mut preimage = SIG_B_TAG.to_vec();
        preimage.extend_from_slice(transcript_a);
        preimage.extend_from_slice(&self.authenticated_bytes());
        preimage
    }

    /// Preimage seSigB is computed over.
    pub fn se_signature_preimage(&self, transcript_a: &[u8; 32]) -> Vec<u8> {
        let mut preimage = SE_SIG_B_TAG.to_vec();
        preimage.extend_from_slice(transcript_a);
        preimage.extend_from_slice(&self.authenticated_bytes());
        preimage
    }

    /// Canonical wire encoding. Also the bytes transcriptB hashes.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.put_u8(self.version);
        writer.put_u16(self.selected_suite.wire_id());
        writer.put_bytes(&self.responder_share);
        writer.put_fixed(&self.server_nonce);
        writer.put_bytes(&self.encrypted_payload.encapsulated_key);
        writer.put_fixed(&self.encrypted_payload.nonce);
        writer.put_bytes(&self.encrypted_payload.ciphertext);
        writer.put_fixed(&self.encrypted_payload.tag);
        writer.put_bytes(&self.signature);
        writer.put_bytes(&self.identity_key.encode());
        match &self.se_signature {
            Some(sig) => writer.put_bytes(sig),
            None => writer.put_u32(0),
        }
        writer.into_bytes()
    }

    /// Decodes and structurally validates a MessageB.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let version = reader.read_u8("version")?;
        let suite_id = reader.read_u16("selected suite")?;
        let selected_suite = CipherSuite::from_wire_id(suite_id)
            .map_err(|e| HandshakeError::InvalidMessageFormat(e.to_string()))?;
        let responder_share = reader.read_bytes("responder share")?.to_vec();
        let server_nonce: [u8; NONCE_BYTES] = reader
            .read_fixed(NONCE_BYTES, "server nonce")?
            .try_into()
            .expect("fixed length read");

        let encapsulated_key = reader.read_bytes("payload encapsulated key")?.to_vec();
        let nonce: [u8; NONCE_LEN] = reader
            .read_fixed(NONCE_LEN, "payload nonce")?
            .try_into()
            .expect("fixed length read");
        let ciphertext = reader.read_bytes("payload ciphertext")?.to_vec();
        let tag: [u8; TAG_LEN] = reader
            .read_fixed(TAG_LEN, "payload tag")?
            .try_into()
            .expect("fixed length read");

        let signature = reader.read_bytes("signature")?.to_vec();
        if signature.is_empty() {
            return Err(HandshakeError::InvalidMessageFormat(
                "empty signature".into(),
            ));
        }
        let identity_key = WireIdentityKey::decode(reader.read_bytes("identity key")?)?;
        let se_sig = reader.read_bytes("se signature")?;
        let se_signature = if se_sig.is_empty() {
            None
        } else {
            Some(se_sig.to_vec())
        };
        reader.expect_end("MessageB")?;

        Ok(Self {
            version,
            selected_suite,
            responder_share,
            server_nonce,
            encrypted_payload: SealedBox {
                encapsulated_key,
                nonce,
                ciphertext,
                tag,
            },
            signature,
            identity_key,
            se_signature,
        })
    }
}

/// Direction of a FINISHED MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedDirection {
    /// Initiator → responder.
    InitiatorToResponder,

    /// Responder → initiator.
    ResponderToInitiator,
}

impl FinishedDirection {
    /// Wire code.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::InitiatorToResponder => 0x01,
            Self::ResponderToInitiator => 0x02,
        }
    }

    /// Label used in the FINISHED key derivation.
    pub fn label(self) -> &'static str {
        match self {
            Self::InitiatorToResponder => "I2R",
            Self::ResponderToInitiator => "R2I",
        }
    }
}

/// Key-confirmation message, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFinished {
    /// Which directional key the MAC is derived from.
    pub direction: FinishedDirection,

    /// HMAC-SHA256 over the transcript hash.
    pub mac: [u8; 32],
}

impl HandshakeFinished {
    /// Whether a frame carries a FINISHED (vs. a handshake message).
    pub fn is_finished_frame(bytes: &[u8]) -> bool {
        bytes.len() >= FINISHED_MAGIC.len() && &bytes[..FINISHED_MAGIC.len()] == FINISHED_MAGIC
    }

    /// Canonical wire encoding: `"FIN1" || direction || mac`.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.put_fixed(FINISHED_MAGIC);
        writer.put_u8(self.direction.wire_code());
        writer.put_fixed(&self.mac);
        writer.into_bytes()
    }

    /// Decodes a FINISHED frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let magic = reader.read_fixed(FINISHED_MAGIC.len(), "finished magic")?;
        if magic != FINISHED_MAGIC {
            return Err(HandshakeError::InvalidMessageFormat(
                "missing FIN1 magic".into(),
            ));
        }
        let direction = match reader.read_u8("finished direction")? {
            0x01 => FinishedDirection::InitiatorToResponder,
            0x02 => FinishedDirection::ResponderToInitiator,
            other => {
                return Err(HandshakeError::InvalidMessageFormat(format!(
                    "unknown finished direction {other:#04x}"
                )))
            }
        };
        let mac: [u8; 32] = reader
            .read_fixed(32, "finished mac")?
            .try_into()
            .expect("fixed length read");
        reader.expect_end("Finished")?;
        Ok(Self { direction, mac })
    }
}
