use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ContentType, EnvelopeKind, Payload, SyncEnvelope};
use crate::device::Platform;
use crate::ids::{DeviceId, EnvelopeId};

/// Body of a `control` envelope.
///
/// Control envelopes ride the clipboard path unencrypted (they carry no user
/// content) and are used for round-trip measurement and device-name refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlBody {
    Ping {
        sent_at: DateTime<Utc>,
    },
    Ack {
        envelope_id: EnvelopeId,
    },
    DeviceAnnounce {
        name: String,
        platform: Platform,
    },
}

impl ControlBody {
    /// Wrap this body in a control envelope from `sender` to `target`.
    pub fn into_envelope(self, sender: DeviceId, target: Option<DeviceId>) -> SyncEnvelope {
        let body = serde_json::to_vec(&self).expect("control body serializes");
        SyncEnvelope::new(
            EnvelopeKind::Control,
            Payload {
                content_type: ContentType::Text,
                ciphertext: body,
                device_id: sender,
                target,
                encryption: None,
                metadata: None,
            },
        )
    }

    pub fn from_envelope(envelope: &SyncEnvelope) -> Option<Self> {
        if envelope.kind != EnvelopeKind::Control {
            return None;
        }
        serde_json::from_slice(&envelope.payload.ciphertext).ok()
    }
}
