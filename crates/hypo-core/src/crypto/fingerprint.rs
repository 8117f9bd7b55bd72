//! Identity fingerprint generation and display.
//!
//! The fingerprint is based on the device's long-term Ed25519 identity public
//! key, so it is stable across restarts and network moves. The full lowercase
//! hex form travels in discovery TXT records and pairing payloads; the
//! grouped short form is for human comparison during pairing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator so identity fingerprints cannot be confused with other
/// SHA-256 uses of the same key.
const FINGERPRINT_DOMAIN: &[u8] = b"hypo-identity-fp-v1";

/// Hex SHA-256 fingerprint of an identity public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityFingerprint(String);

impl IdentityFingerprint {
    const GROUP_SIZE: usize = 4;
    const GROUP_COUNT: usize = 4;

    /// Fingerprint of a device's identity public key (Ed25519, 32 bytes).
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(public_key);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse an already-computed fingerprint, e.g. from a TXT record.
    pub fn from_hex(s: &str) -> Option<Self> {
        let lowered = s.to_ascii_lowercase();
        if lowered.len() == 64 && lowered.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(lowered))
        } else {
            None
        }
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Grouped prefix for human comparison: `ab12-cd34-ef56-7890`.
    pub fn short_code(&self) -> String {
        self.0
            .chars()
            .take(Self::GROUP_SIZE * Self::GROUP_COUNT)
            .collect::<Vec<_>>()
            .chunks(Self::GROUP_SIZE)
            .map(|chunk| chunk.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl std::fmt::Display for IdentityFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = IdentityFingerprint::from_public_key(&[7u8; 32]);
        let b = IdentityFingerprint::from_public_key(&[7u8; 32]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_keys_differ() {
        let a = IdentityFingerprint::from_public_key(&[1u8; 32]);
        let b = IdentityFingerprint::from_public_key(&[2u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_form() {
        let fp = IdentityFingerprint::from_public_key(&[0u8; 32]);
        assert_eq!(fp.as_hex().len(), 64);
        assert!(fp.as_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_code_shape() {
        let fp = IdentityFingerprint::from_public_key(&[0u8; 32]);
        let short = fp.short_code();
        assert_eq!(short.len(), 19);
        assert_eq!(short.matches('-').count(), 3);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(IdentityFingerprint::from_hex("abcd").is_none());
        assert!(IdentityFingerprint::from_hex(&"zz".repeat(32)).is_none());
        let valid = "ab".repeat(32);
        assert!(IdentityFingerprint::from_hex(&valid).is_some());
    }
}
