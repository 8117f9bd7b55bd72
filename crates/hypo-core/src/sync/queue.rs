use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::envelope::SyncEnvelope;
use crate::ids::DeviceId;

/// One sealed envelope waiting for delivery to one peer.
#[derive(Debug, Clone)]
pub struct QueuedSyncMessage {
    pub envelope: SyncEnvelope,
    pub target_device_id: DeviceId,
    pub queued_at: Instant,
}

impl QueuedSyncMessage {
    pub fn new(envelope: SyncEnvelope, target_device_id: DeviceId) -> Self {
        Self {
            envelope,
            target_device_id,
            queued_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant, validity: Duration) -> bool {
        now.duration_since(self.queued_at) > validity
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.queued_at)
    }
}

/// In-memory outbound queue, preserved across transport reconnects.
///
/// Entries survive delivery failures and are retried until the validity
/// window elapses. Ordering is FIFO per enqueue.
#[derive(Debug)]
pub struct SyncQueue {
    entries: VecDeque<QueuedSyncMessage>,
    validity: Duration,
}

impl SyncQueue {
    pub fn new(validity: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            validity,
        }
    }

    pub fn push(&mut self, message: QueuedSyncMessage) {
        self.entries.push_back(message);
    }

    /// Remove and return every entry older than the validity window.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<QueuedSyncMessage> {
        let validity = self.validity;
        let mut expired = Vec::new();
        self.entries.retain(|entry| {
            if entry.is_expired(now, validity) {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn pop(&mut self) -> Option<QueuedSyncMessage> {
        self.entries.pop_front()
    }

    /// Put a failed delivery back for a later retry.
    pub fn requeue(&mut self, message: QueuedSyncMessage) {
        self.entries.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
