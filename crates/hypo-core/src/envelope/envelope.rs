use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Payload;
use crate::ids::EnvelopeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Clipboard,
    Control,
}

/// The unit carried over every transport, one per WebSocket binary message.
///
/// `id` is unique per originating device and is the idempotency key for
/// deduplication and round-trip timing. Serialized field order is fixed so
/// the encoded form is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncEnvelope {
    pub id: EnvelopeId,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl SyncEnvelope {
    pub fn new(kind: EnvelopeKind, payload: Payload) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn is_clipboard(&self) -> bool {
        self.kind == EnvelopeKind::Clipboard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ContentType, EncryptionMeta};
    use crate::ids::DeviceId;

    fn envelope() -> SyncEnvelope {
        SyncEnvelope::new(
            EnvelopeKind::Clipboard,
            Payload {
                content_type: ContentType::Text,
                ciphertext: vec![1, 2, 3],
                device_id: DeviceId::new("mac"),
                target: Some(DeviceId::new("android")),
                encryption: Some(EncryptionMeta {
                    nonce: vec![2],
                    tag: vec![3],
                }),
                metadata: None,
            },
        )
    }

    #[test]
    fn test_kind_serializes_as_type() {
        let json = serde_json::to_value(envelope()).unwrap();
        assert_eq!(json["type"], "clipboard");
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_created_at_is_rfc3339() {
        let json = serde_json::to_value(envelope()).unwrap();
        let raw = json["created_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(raw).is_ok());
    }

    #[test]
    fn test_fresh_ids_per_envelope() {
        assert_ne!(envelope().id, envelope().id);
    }

    #[test]
    fn test_roundtrip() {
        let e = envelope();
        let json = serde_json::to_string(&e).unwrap();
        let restored: SyncEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, e);
    }
}
