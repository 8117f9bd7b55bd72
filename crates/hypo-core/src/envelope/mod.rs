//! The sync envelope: the top-level encrypted unit carried over transports.

mod assembler;
mod content_type;
mod control;
mod envelope;
pub mod meta_keys;
mod payload;

pub use assembler::EnvelopeAssembler;
pub use content_type::ContentType;
pub use control::ControlBody;
pub use envelope::{EnvelopeKind, SyncEnvelope};
pub use payload::{EncryptionMeta, Payload};

/// Serde helpers for byte fields carried as base64 strings on the wire.
pub(crate) mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
