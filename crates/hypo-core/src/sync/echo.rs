use crate::clipboard::ClipboardEvent;
use crate::ids::DeviceId;

/// Suppresses clipboard echoes.
///
/// A received envelope is injected into the host clipboard, which re-fires
/// the local change watcher; without suppression that copy would bounce back
/// to the peer forever. Suppression compares the event's origin against the
/// local device and its content hash against the last inbound content.
#[derive(Debug)]
pub struct EchoFilter {
    local_device: DeviceId,
    last_inbound_hash: Option<String>,
}

impl EchoFilter {
    pub fn new(local_device: DeviceId) -> Self {
        Self {
            local_device,
            last_inbound_hash: None,
        }
    }

    /// Whether a local clipboard event should be synced out.
    pub fn should_send(&self, event: &ClipboardEvent) -> bool {
        if event.origin != self.local_device {
            return false;
        }
        self.last_inbound_hash.as_deref() != Some(event.content_hash().as_str())
    }

    /// Record the content hash of an applied inbound envelope.
    pub fn note_inbound(&mut self, content_hash: String) {
        self.last_inbound_hash = Some(content_hash);
    }
}
