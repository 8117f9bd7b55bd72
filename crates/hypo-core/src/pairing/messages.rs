use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::b64;
use crate::ids::{ChallengeId, DeviceId};

/// Handshake messages, exchanged as WebSocket text frames.
///
/// Text frames are always pairing; binary frames are always clipboard
/// envelopes. The `kind` tag distinguishes the two handshake directions
/// without sniffing field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairingMessage {
    Challenge(PairingChallenge),
    Ack(PairingAck),
}

impl PairingMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("pairing message serializes")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Initiator → responder. The ciphertext seals a [`ChallengeSecret`] under
/// the derived shared key with the initiator's device id as AAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingChallenge {
    pub challenge_id: ChallengeId,
    pub initiator_device_id: DeviceId,
    pub initiator_device_name: String,
    /// Initiator's X25519 public key (32 bytes), so the responder can derive
    /// the same shared key.
    #[serde(with = "b64")]
    pub initiator_pub_key: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

/// Responder → initiator. The ciphertext seals an [`AckSecret`] under the
/// shared key with the responder's device id as AAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingAck {
    pub challenge_id: ChallengeId,
    pub responder_device_id: DeviceId,
    pub responder_device_name: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

/// Plaintext body of a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSecret {
    #[serde(with = "b64")]
    pub challenge_bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Plaintext body of an ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSecret {
    /// SHA-256 of the challenge bytes.
    #[serde(with = "b64")]
    pub response_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    /// Present when the responder's X25519 key was not already known from an
    /// out-of-band payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_pub_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_tag_on_wire() {
        let msg = PairingMessage::Challenge(PairingChallenge {
            challenge_id: ChallengeId::new(),
            initiator_device_id: DeviceId::new("mac"),
            initiator_device_name: "Desk".to_string(),
            initiator_pub_key: vec![1; 32],
            nonce: vec![2; 12],
            ciphertext: vec![3],
            tag: vec![4; 16],
        });
        let json: serde_json::Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(json["kind"], "challenge");
    }

    #[test]
    fn test_roundtrip_ack() {
        let msg = PairingMessage::Ack(PairingAck {
            challenge_id: ChallengeId::new(),
            responder_device_id: DeviceId::new("android"),
            responder_device_name: "Phone".to_string(),
            nonce: vec![2; 12],
            ciphertext: vec![3],
            tag: vec![4; 16],
        });
        let decoded = PairingMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_clipboard_frame_is_not_a_pairing_message() {
        // A clipboard envelope body must not parse as a pairing message.
        let raw = r#"{"id":"x","type":"clipboard","payload":{},"created_at":"now"}"#;
        assert!(PairingMessage::decode(raw).is_err());
    }
}
