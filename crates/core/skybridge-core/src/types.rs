//! Common identifier types used throughout the SkyBridge stack.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a remote device.
///
/// Device ids are assigned at first pairing and key trust records, fallback
/// cooldowns and security events. They are opaque strings (the discovery
/// layer typically derives them from the advertised service instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creates an abbreviated version of this id for logging.
    ///
    /// Full device ids can be stable hardware identifiers; logs only ever see
    /// the first few characters.
    pub fn anonymized(&self) -> String {
        let head: String = self.0.chars().take(6).collect();
        format!("device_{head}****")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.anonymized())
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Role a party plays in a single handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The side that sends MessageA and awaits MessageB.
    Initiator,

    /// The side that answers MessageA with MessageB.
    Responder,
}

impl Role {
    /// Wire code used in canonical transcript encodings.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::Initiator => 0x01,
            Self::Responder => 0x02,
        }
    }

    /// Returns the opposite role.
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_anonymization_hides_tail() {
        let id = DeviceId::new("ABCDEF0123456789");
        assert_eq!(id.anonymized(), "device_ABCDEF****");
        assert_eq!(id.as_str(), "ABCDEF0123456789");
    }

    #[test]
    fn role_peer_is_involutive() {
        assert_eq!(Role::Initiator.peer(), Role::Responder);
        assert_eq!(Role::Responder.peer().peer(), Role::Responder);
    }
}
