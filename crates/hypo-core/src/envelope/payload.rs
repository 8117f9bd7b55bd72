use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{b64, ContentType};
use crate::ids::DeviceId;

/// Nonce and tag of an AEAD-sealed payload, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionMeta {
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

/// The body of a [`super::SyncEnvelope`].
///
/// When `encryption` is absent the ciphertext field is transport-layer-only
/// plaintext, permitted only for control messages and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Payload {
    pub content_type: ContentType,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Sender device id; also the AAD under which the ciphertext was sealed.
    pub device_id: DeviceId,
    pub target: Option<DeviceId>,
    pub encryption: Option<EncryptionMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Payload {
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Payload {
        Payload {
            content_type: ContentType::Text,
            ciphertext: vec![0x01, 0x02, 0x03],
            device_id: DeviceId::new("mac"),
            target: Some(DeviceId::new("android")),
            encryption: Some(EncryptionMeta {
                nonce: vec![0x02],
                tag: vec![0x03],
            }),
            metadata: None,
        }
    }

    #[test]
    fn test_wire_field_names_and_base64() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["content_type"], "text");
        assert_eq!(json["ciphertext"], "AQID");
        assert_eq!(json["device_id"], "mac");
        assert_eq!(json["target"], "android");
        assert_eq!(json["encryption"]["nonce"], "Ag==");
        assert_eq!(json["encryption"]["tag"], "Aw==");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_roundtrip() {
        let payload = sample();
        let json = serde_json::to_string(&payload).unwrap();
        let restored: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{
            "content_type": "text",
            "ciphertext": "AQID",
            "device_id": "mac",
            "target": null,
            "encryption": null,
            "surprise": 1
        }"#;
        assert!(serde_json::from_str::<Payload>(json).is_err());
    }

    #[test]
    fn test_plaintext_payload_is_unencrypted() {
        let mut p = sample();
        p.encryption = None;
        assert!(!p.is_encrypted());
    }
}
