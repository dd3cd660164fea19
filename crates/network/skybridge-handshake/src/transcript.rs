//! Canonical transcript encodings: V1 deterministic and V2 TLV.
//!
//! Both formats share the domain separator and the declared field order;
//! only the framing differs. The transcript hash feeds the identity
//! signature preimages and the final key schedule, and the policy rides
//! inside it (policy-in-transcript).

use crate::error::{HandshakeError, Result};
use sha2::{Digest, Sha256};
use skybridge_core::{HandshakePolicy, Role};
use skybridge_crypto::{CipherSuite, SignatureAlgorithm};

/// Domain separator shared by both transcript formats.
pub const DOMAIN_SEPARATOR: &[u8] = b"SkyBridge-Transcript";

/// Transcript encoding versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TranscriptVersion {
    /// Length-prefixed fields in fixed declaration order.
    V1,

    /// Tag-length-value with reserved tag ranges.
    V2,
}

impl TranscriptVersion {
    /// Protocol version byte announcing this transcript format.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Resolves an announced version byte.
    pub fn from_wire_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(HandshakeError::VersionMismatch {
                local: Self::V2.wire_code(),
                peer: other,
            }),
        }
    }

    /// Picks the version a responder runs given the initiator's announced
    /// maximum.
    ///
    /// The announcement is the highest version the initiator supports, and
    /// support sets are contiguous, so the highest version in both sets is
    /// the highest locally supported version not above the announcement.
    /// No overlap (including an announcement this build does not know)
    /// is a hard failure; versions are never coerced.
    pub fn negotiate(supported: &[TranscriptVersion], announced: u8) -> Result<Self> {
        let peer_max = Self::from_wire_code(announced)?;
        supported
            .iter()
            .copied()
            .filter(|version| *version <= peer_max)
            .max()
            .ok_or(HandshakeError::VersionMismatch {
                local: supported
                    .iter()
                    .copied()
                    .min()
                    .map(Self::wire_code)
                    .unwrap_or(0),
                peer: announced,
            })
    }
}

// TLV tags. Reserved ranges: 0x01-0x0F header, 0x10-0x1F negotiation,
// 0x20-0x2F messages, 0x30-0x3F identity, 0xF0-0xFF extensions.
const TAG_DOMAIN: u8 = 0x01;
const TAG_PROTOCOL_VERSION: u8 = 0x02;
const TAG_ROLE: u8 = 0x03;
const TAG_SUITE: u8 = 0x10;
const TAG_LOCAL_CAPABILITIES: u8 = 0x11;
const TAG_PEER_CAPABILITIES: u8 = 0x12;
const TAG_POLICY: u8 = 0x13;
const TAG_SIGNATURE_ALGORITHM: u8 = 0x14;
const TAG_INITIATOR_NONCE: u8 = 0x15;
const TAG_RESPONDER_NONCE: u8 = 0x16;
const TAG_MESSAGE_A: u8 = 0x20;
const TAG_MESSAGE_B: u8 = 0x21;
const TAG_INITIATOR_PUBKEY: u8 = 0x30;
const TAG_RESPONDER_PUBKEY: u8 = 0x31;

/// Declaration order of every transcript field.
const TAG_ORDER: [u8; 14] = [
    TAG_DOMAIN,
    TAG_PROTOCOL_VERSION,
    TAG_ROLE,
    TAG_SUITE,
    TAG_LOCAL_CAPABILITIES,
    TAG_PEER_CAPABILITIES,
    TAG_POLICY,
    TAG_SIGNATURE_ALGORITHM,
    TAG_INITIATOR_PUBKEY,
    TAG_RESPONDER_PUBKEY,
    TAG_INITIATOR_NONCE,
    TAG_RESPONDER_NONCE,
    TAG_MESSAGE_A,
    TAG_MESSAGE_B,
];

/// Builds transcript encodings field by field.
///
/// Unset fields are omitted; the surrounding state machine knows which
/// fields are required at each stage.
#[derive(Debug, Clone, Default)]
pub struct TranscriptBuilder {
    protocol_version: Option<u32>,
    role: Option<Role>,
    suite: Option<CipherSuite>,
    local_capabilities: Option<Vec<u8>>,
    peer_capabilities: Option<Vec<u8>>,
    policy: Option<HandshakePolicy>,
    signature_algorithm: Option<SignatureAlgorithm>,
    initiator_public_key: Option<Vec<u8>>,
    responder_public_key: Option<Vec<u8>>,
    initiator_nonce: Option<[u8; 32]>,
    responder_nonce: Option<[u8; 32]>,
    message_a: Option<Vec<u8>>,
    message_b: Option<Vec<u8>>,
}

impl TranscriptBuilder {
    /// Starts an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the protocol version.
    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = Some(version);
        self
    }

    /// Sets the role of the message sender being hashed.
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Sets the negotiated suite.
    pub fn suite(mut self, suite: CipherSuite) -> Self {
        self.suite = Some(suite);
        self
    }

    /// Sets the sender's capability encoding.
    pub fn local_capabilities(mut self, bytes: Vec<u8>) -> Self {
        self.local_capabilities = Some(bytes);
        self
    }

    /// Sets the peer's capability encoding.
    pub fn peer_capabilities(mut self, bytes: Vec<u8>) -> Self {
        self.peer_capabilities = Some(bytes);
        self
    }

    /// Sets the handshake policy.
    pub fn policy(mut self, policy: HandshakePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the protocol signature algorithm.
    pub fn signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signature_algorithm = Some(algorithm);
        self
    }

    /// Sets the initiator identity public key.
    pub fn initiator_public_key(mut self, key: Vec<u8>) -> Self {
        self.initiator_public_key = Some(key);
        self
    }

    /// Sets the responder identity public key.
    pub fn responder_public_key(mut self, key: Vec<u8>) -> Self {
        self.responder_public_key = Some(key);
        self
    }

    /// Sets the initiator nonce.
    pub fn initiator_nonce(mut self, nonce: [u8; 32]) -> Self {
        self.initiator_nonce = Some(nonce);
        self
    }

    /// Sets the responder nonce.
    pub fn responder_nonce(mut self, nonce: [u8; 32]) -> Self {
        self.responder_nonce = Some(nonce);
        self
    }

    /// Sets the full MessageA bytes.
    pub fn message_a(mut self, bytes: Vec<u8>) -> Self {
        self.message_a = Some(bytes);
        self
    }

    /// Sets the full MessageB bytes.
    pub fn message_b(mut self, bytes: Vec<u8>) -> Self {
        self.message_b = Some(bytes);
        self
    }

    fn fields(&self) -> Vec<(u8, Vec<u8>)> {
        let mut fields: Vec<(u8, Vec<u8>)> = vec![(TAG_DOMAIN, DOMAIN_SEPARATOR.to_vec())];
        if let Some(v) = self.protocol_version {
            fields.push((TAG_PROTOCOL_VERSION, v.to_be_bytes().to_vec()));
        }
        if let Some(role) = self.role {
            fields.push((TAG_ROLE, vec![role.wire_code()]));
        }
        if let Some(suite) = self.suite {
            fields.push((TAG_SUITE, suite.wire_id().to_be_bytes().to_vec()));
        }
        if let Some(caps) = &self.local_capabilities {
            fields.push((TAG_LOCAL_CAPABILITIES, caps.clone()));
        }
        if let Some(caps) = &self.peer_capabilities {
            fields.push((TAG_PEER_CAPABILITIES, caps.clone()));
        }
        if let Some(policy) = &self.policy {
            fields.push((TAG_POLICY, policy.canonical_bytes().to_vec()));
        }
        if let Some(algorithm) = self.signature_algorithm {
            fields.push((
                TAG_SIGNATURE_ALGORITHM,
                algorithm.wire_code().to_be_bytes().to_vec(),
            ));
        }
        if let Some(key) = &self.initiator_public_key {
            fields.push((TAG_INITIATOR_PUBKEY, key.clone()));
        }
        if let Some(key) = &self.responder_public_key {
            fields.push((TAG_RESPONDER_PUBKEY, key.clone()));
        }
        if let Some(nonce) = self.initiator_nonce {
            fields.push((TAG_INITIATOR_NONCE, nonce.to_vec()));
        }
        if let Some(nonce) = self.responder_nonce {
            fields.push((TAG_RESPONDER_NONCE, nonce.to_vec()));
        }
        if let Some(bytes) = &self.message_a {
            fields.push((TAG_MESSAGE_A, bytes.clone()));
        }
        if let Some(bytes) = &self.message_b {
            fields.push((TAG_MESSAGE_B, bytes.clone()));
        }

        // Emit in declaration order regardless of setter order.
        fields.sort_by_key(|(tag, _)| {
            TAG_ORDER
                .iter()
                .position(|t| t == tag)
                .expect("every tag is declared")
        });
        fields
    }

    /// Encodes the set fields with the given version.
    pub fn encode(&self, version: TranscriptVersion) -> Vec<u8> {
        let fields = self.fields();
        let mut out = Vec::new();
        match version {
            TranscriptVersion::V1 => {
                for (_, value) in fields {
                    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    out.extend_from_slice(&value);
                }
            }
            TranscriptVersion::V2 => {
                for (tag, value) in fields {
                    out.push(tag);
                    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    out.extend_from_slice(&value);
                }
            }
        }
        out
    }

    /// SHA-256 over the canonical encoding.
    pub fn hash(&self, version: TranscriptVersion) -> [u8; 32] {
        Sha256::digest(self.encode(version)).into()
    }
}

/// Decodes a V2 TLV transcript into `(tag, value)` pairs.
///
/// Duplicate tags are rejected; unknown tags (including the reserved
/// extension range) are rejected fail-closed.
pub fn tlv_decode(bytes: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut fields = Vec::new();
    let mut seen = [false; 256];
    let mut pos = 0usize;
    while pos < bytes.len() {
        if bytes.len() - pos < 5 {
            return Err(HandshakeError::InvalidMessageFormat(
                "truncated TLV header".into(),
            ));
        }
        let tag = bytes[pos];
        if !TAG_ORDER.contains(&tag) {
            return Err(HandshakeError::InvalidMessageFormat(format!(
                "unknown transcript tag {tag:#04x}"
            )));
        }
        if seen[tag as usize] {
            return Err(HandshakeError::InvalidMessageFormat(format!(
                "duplicate transcript tag {tag:#04x}"
            )));
        }
        seen[tag as usize] = true;
        let len = u32::from_be_bytes([
            bytes[pos + 1],
            bytes[pos + 2],
            bytes[pos + 3],
            bytes[pos + 4],
        ]) as usize;
        pos += 5;
        if bytes.len() - pos < len {
            return Err(HandshakeError::InvalidMessageFormat(
                "truncated TLV value".into(),
            ));
        }
        fields.push((tag, bytes[pos..pos + len].to_vec()));
        pos += len;
    }
    Ok(fields)
}
