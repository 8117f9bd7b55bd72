//! Sync-engine domain logic: deduplication, the outbound queue, and echo
//! suppression. All pure state machines; the engine drives them.

mod dedup;
mod echo;
mod queue;

pub use dedup::DedupSet;
pub use echo::EchoFilter;
pub use queue::{QueuedSyncMessage, SyncQueue};

use std::time::Duration;

/// How long an enqueued message stays valid before it is dropped.
pub const QUEUE_VALIDITY: Duration = Duration::from_secs(60);

/// How long an envelope id is remembered for deduplication.
pub const DEDUP_TTL: Duration = Duration::from_secs(60);
