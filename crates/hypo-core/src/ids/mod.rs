pub mod device_id;
mod id_macro;

use serde::{Deserialize, Serialize};

pub use device_id::DeviceId;

/// Unique identifier of a [`crate::envelope::SyncEnvelope`].
///
/// Minted once per envelope on the originating device; the idempotency key
/// for deduplication and round-trip timing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(String);

/// Identifier of one pairing challenge/ack exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId(String);

id_macro::impl_id!(EnvelopeId, ChallengeId);
