//! The domain clipboard event exchanged with the host glue.
//!
//! Capture and injection on the host OS live outside the sync core; this is
//! the shape they hand in (outbound) and receive (inbound).

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::envelope::ContentType;
use crate::ids::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEvent {
    /// Device on which the content was copied.
    pub origin: DeviceId,
    pub content_type: ContentType,
    /// UTF-8 bytes for text/link; raw bytes for image/file.
    pub bytes: Vec<u8>,
    /// Filename, mime, dimensions, content hash, sender name/platform.
    pub metadata: BTreeMap<String, String>,
    pub captured_at: DateTime<Utc>,
}

impl ClipboardEvent {
    pub fn new(origin: DeviceId, content_type: ContentType, bytes: Vec<u8>) -> Self {
        Self {
            origin,
            content_type,
            bytes,
            metadata: BTreeMap::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn text(origin: DeviceId, text: &str) -> Self {
        Self::new(origin, ContentType::Text, text.as_bytes().to_vec())
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Hex SHA-256 of the content, used for echo suppression.
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = ClipboardEvent::text(DeviceId::new("mac"), "hello");
        let b = ClipboardEvent::text(DeviceId::new("mac"), "hello");
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_differs_by_content() {
        let a = ClipboardEvent::text(DeviceId::new("mac"), "hello");
        let b = ClipboardEvent::text(DeviceId::new("mac"), "world");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_known_sha256_vector() {
        let event = ClipboardEvent::text(DeviceId::new("mac"), "abc");
        assert_eq!(
            event.content_hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
