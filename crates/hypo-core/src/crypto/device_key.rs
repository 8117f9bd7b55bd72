use base64::Engine;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AeadError;

/// Symmetric key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// The 32-byte symmetric key shared with one paired peer.
///
/// Exactly one active key exists per peer pair; pairing the same peer again
/// replaces it. The key never leaves the device unencrypted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKey([u8; KEY_LEN]);

impl DeviceKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AeadError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| AeadError::Decrypt)?;
        Ok(Self(arr))
    }

    /// Encoding used when the key is handed to the host secure store.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, AeadError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AeadError::Decrypt)?;
        Self::from_slice(&bytes)
    }
}

// Keep key material out of logs.
impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let key = DeviceKey::new([0xAA; KEY_LEN]);
        let restored = DeviceKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(restored, key);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(DeviceKey::from_slice(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = DeviceKey::new([0x42; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "DeviceKey(..)");
    }
}
