use async_trait::async_trait;
use tokio::sync::watch;

use crate::device::PairedDevice;
use crate::envelope::SyncEnvelope;
use crate::error::DispatcherError;
use crate::events::{ConnectionState, TransportKind};
use crate::ids::DeviceId;

/// The narrow capability the sync engine holds on the transport layer.
///
/// Keeps the engine ↔ transport-manager relationship acyclic: the manager
/// calls back through an installed handler, the engine calls forward through
/// this port.
#[async_trait]
pub trait SyncTransportPort: Send + Sync {
    /// Deliver one envelope to one peer, LAN-first with cloud fallback.
    async fn dispatch(
        &self,
        envelope: SyncEnvelope,
        target: &DeviceId,
    ) -> Result<TransportKind, DispatcherError>;

    fn paired_devices(&self) -> Vec<PairedDevice>;

    /// Global (cloud) connection state, observable for UI and for waking the
    /// queue processor on reconnect.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    async fn note_device_seen(&self, device_id: &DeviceId);
}
