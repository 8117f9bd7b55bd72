//! Builds outbound envelopes and opens inbound ones.
//!
//! The AAD is the sender's canonical device id, which binds each ciphertext
//! to its originator: a misrouted envelope cannot be accepted as another
//! peer's payload.

use std::collections::BTreeMap;

use super::{meta_keys, EncryptionMeta, EnvelopeKind, Payload, SyncEnvelope};
use crate::clipboard::ClipboardEvent;
use crate::crypto::{self, DeviceKey};
use crate::error::AeadError;
use crate::ids::DeviceId;

pub struct EnvelopeAssembler;

impl EnvelopeAssembler {
    /// Seal a clipboard event for one target peer.
    pub fn build(
        event: &ClipboardEvent,
        target: &DeviceId,
        key: &DeviceKey,
    ) -> Result<SyncEnvelope, AeadError> {
        let sender = event.origin.clone();

        let mut metadata: BTreeMap<String, String> = event.metadata.clone();
        metadata.insert(meta_keys::CONTENT_HASH.to_string(), event.content_hash());

        let sealed = crypto::seal(&event.bytes, key, sender.as_str().as_bytes())?;

        let payload = Payload {
            content_type: event.content_type,
            ciphertext: sealed.ciphertext,
            device_id: sender,
            target: Some(target.clone()),
            encryption: Some(EncryptionMeta {
                nonce: sealed.nonce.to_vec(),
                tag: sealed.tag.to_vec(),
            }),
            metadata: Some(metadata),
        };

        Ok(SyncEnvelope::new(EnvelopeKind::Clipboard, payload))
    }

    /// Open an inbound envelope with the sender's stored key.
    pub fn open(envelope: &SyncEnvelope, key: &DeviceKey) -> Result<ClipboardEvent, AeadError> {
        let payload = &envelope.payload;
        let encryption = payload.encryption.as_ref().ok_or(AeadError::Decrypt)?;

        let plaintext = crypto::open(
            &payload.ciphertext,
            key,
            &encryption.nonce,
            &encryption.tag,
            payload.device_id.as_str().as_bytes(),
        )?;

        Ok(ClipboardEvent {
            origin: payload.device_id.clone(),
            content_type: payload.content_type,
            bytes: plaintext,
            metadata: payload.metadata.clone().unwrap_or_default(),
            captured_at: envelope.created_at,
        })
    }
}
