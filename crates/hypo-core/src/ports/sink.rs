use async_trait::async_trait;

use crate::clipboard::ClipboardEvent;
use crate::error::AeadError;
use crate::ids::DeviceId;

/// The upward collaborator that receives decrypted inbound clipboard events.
///
/// Installed once on the sync engine at startup; the history store and the
/// host clipboard writer sit behind it.
#[async_trait]
pub trait ClipboardSink: Send + Sync {
    async fn on_clipboard(&self, event: ClipboardEvent);

    /// A single envelope failed to decrypt. The connection stays up; this is
    /// a diagnostic, not a transport failure.
    async fn on_decryption_error(&self, sender: DeviceId, error: AeadError) {
        let _ = (sender, error);
    }
}
